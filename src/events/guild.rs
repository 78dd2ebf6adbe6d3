use poise::serenity_prelude as serenity;
use tracing::{debug, error, info};

use crate::managers::RoleChange;
use crate::{Data, Error};

/// Register a guild when the bot joins it or starts up
pub async fn handle_guild_create(
    guild: &serenity::Guild,
    is_new: Option<bool>,
    data: &Data,
) -> Result<(), Error> {
    info!(
        "Processing guild: {} ({}){}",
        guild.name,
        guild.id,
        if is_new == Some(true) { " [new]" } else { "" }
    );

    data.service
        .register_server(&guild.id.to_string(), &guild.owner_id.to_string())
        .await?;
    Ok(())
}

/// Give returning verified members their role back
pub async fn handle_member_add(new_member: &serenity::Member, data: &Data) -> Result<(), Error> {
    let user_id = new_member.user.id;
    let guild_id = new_member.guild_id;
    debug!("New member joined: {} in guild {}", new_member.user.name, guild_id);

    match data
        .service
        .sync_member(&guild_id.to_string(), &user_id.to_string())
        .await
    {
        Ok(Some(RoleChange::Added)) => {
            info!(
                "Restored verified role for returning member {} in guild {}",
                new_member.user.name, guild_id
            );
        }
        Ok(_) => {}
        Err(e) => {
            error!(
                "Failed to sync role for {} in guild {}: {}. Bot requires 'Manage Roles' permission and its role must be above the verified role.",
                user_id, guild_id, e
            );
        }
    }
    Ok(())
}
