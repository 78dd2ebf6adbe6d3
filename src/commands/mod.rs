pub mod admin;
pub mod general;
pub mod verification;

pub use admin::{
    get_subscription, set_role, set_tier, subscription_status, update_tier, verification_logs,
};
pub use general::{get_verify_bot, help, ping};
pub use verification::{reverify, verifyme};

use tracing::warn;

use crate::{Context, Error};

/// Send an ephemeral text reply
pub async fn reply(ctx: Context<'_>, content: impl Into<String>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(content.into())
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Approximate member count of the invoking guild
pub async fn member_count(ctx: Context<'_>) -> Option<u64> {
    let guild_id = ctx.guild_id()?;
    match guild_id.to_partial_guild_with_counts(ctx.http()).await {
        Ok(guild) => guild.approximate_member_count,
        Err(e) => {
            warn!("Could not fetch member count for guild {}: {}", guild_id, e);
            None
        }
    }
}
