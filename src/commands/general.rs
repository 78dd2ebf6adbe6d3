use poise::serenity_prelude as serenity;
use tracing::info;

use super::reply;
use crate::{Context, Error};

const PRODUCT_URL: &str = "https://esattotech.com/age-verification-solution/";

/// Manage Roles
const BOT_PERMISSIONS: u64 = 268_435_456;

/// Check if the bot is running
#[poise::command(slash_command, guild_only)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    info!("Ping command called by {}", ctx.author().name);
    reply(ctx, "Pong!").await
}

/// Show help information
#[poise::command(slash_command, guild_only)]
pub async fn help(ctx: Context<'_>) -> Result<(), Error> {
    let embed = serenity::CreateEmbed::new()
        .title("Age Verification Commands")
        .description("Available commands:")
        .field("/verifyme", "Start the age verification process", false)
        .field("/reverify", "Verify again after the cooldown period", false)
        .field("/set_role", "Set the role granted to verified members (Admin)", false)
        .field("/set_tier", "Set the subscription tier (Admin)", false)
        .field("/update_tier", "Recompute the tier from the member count (Admin)", false)
        .field("/subscription_status", "Show subscription details (Admin)", false)
        .field("/verification_logs", "Show recent verification actions (Admin)", false)
        .field("/get_subscription", "Get the subscription link (Admin)", false)
        .field("/get_verify_bot", "Add this bot to your own server", false)
        .color(0x3498db);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Link for adding the bot to another server
pub fn invite_url(client_id: Option<&str>) -> String {
    match client_id {
        Some(id) => format!(
            "https://discord.com/oauth2/authorize?client_id={}&permissions={}&scope={}",
            urlencoding::encode(id),
            BOT_PERMISSIONS,
            urlencoding::encode("bot applications.commands")
        ),
        None => PRODUCT_URL.to_string(),
    }
}

/// Get the link to add this bot to your server
#[poise::command(slash_command, guild_only)]
pub async fn get_verify_bot(ctx: Context<'_>) -> Result<(), Error> {
    let url = invite_url(ctx.data().config.bot_client_id.as_deref());
    reply(
        ctx,
        format!("Click the link to add this bot to your server: {}", url),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_url() {
        assert_eq!(
            invite_url(Some("1234")),
            "https://discord.com/oauth2/authorize?client_id=1234&permissions=268435456&scope=bot%20applications.commands"
        );
        assert_eq!(invite_url(None), PRODUCT_URL);
    }
}
