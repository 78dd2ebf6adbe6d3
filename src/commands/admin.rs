use poise::serenity_prelude as serenity;
use tracing::{error, info};

use super::{member_count, reply};
use crate::managers::tier::{member_limit, TierThreshold};
use crate::managers::Tier;
use crate::state::{LogAction, SubscriptionStatus, VerificationLogEntry};
use crate::{Context, Error};

const NOT_CONFIGURED: &str =
    "This server is not configured for verification. Please type /set_role to configure.";

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum TierChoice {
    #[name = "Tier A"]
    A,
    #[name = "Tier B"]
    B,
    #[name = "Tier C"]
    C,
    #[name = "Tier D"]
    D,
    #[name = "Tier E"]
    E,
}

impl From<TierChoice> for Tier {
    fn from(choice: TierChoice) -> Self {
        match choice {
            TierChoice::A => Tier::A,
            TierChoice::B => Tier::B,
            TierChoice::C => Tier::C,
            TierChoice::D => Tier::D,
            TierChoice::E => Tier::E,
        }
    }
}

/// Set the role granted to verified members
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn set_role(
    ctx: Context<'_>,
    #[description = "Role granted after a successful verification"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a guild")?;
    info!("set_role {} called by {} in {}", role.name, ctx.author().name, guild_id);

    let owner_id = match guild_id.to_partial_guild(ctx.http()).await {
        Ok(guild) => guild.owner_id,
        Err(_) => ctx.author().id,
    };

    ctx.data()
        .service
        .set_role(&guild_id.to_string(), &owner_id.to_string(), &role.id.to_string())
        .await?;
    reply(ctx, format!("Verification role set to: {}", role.name)).await
}

/// Set the subscription tier for this server
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn set_tier(
    ctx: Context<'_>,
    #[description = "Subscription tier"] tier: TierChoice,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a guild")?;
    let tier = Tier::from(tier);

    if ctx.data().service.set_tier(&guild_id.to_string(), tier).await? {
        reply(ctx, format!("Subscription tier set to: Tier {}", tier)).await
    } else {
        reply(ctx, NOT_CONFIGURED).await
    }
}

/// Recompute the tier from the current member count
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn update_tier(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a guild")?;
    let Some(count) = member_count(ctx).await else {
        return reply(ctx, "Could not determine the member count of this server. Please try again later.").await;
    };

    match ctx
        .data()
        .service
        .recompute_tier(&guild_id.to_string(), count)
        .await?
    {
        Some(tier) => {
            reply(
                ctx,
                format!("Tier updated to Tier {} for {} members.", tier, count),
            )
            .await
        }
        None => reply(ctx, NOT_CONFIGURED).await,
    }
}

/// Embed describing the server's plan against its member count
pub fn status_embed(
    status: &SubscriptionStatus,
    member_count: Option<u64>,
    required: Option<Tier>,
    thresholds: &[TierThreshold],
) -> serenity::CreateEmbed {
    let limit = match member_limit(status.tier, thresholds) {
        Some(limit) => limit.to_string(),
        None => "Unlimited".to_string(),
    };
    let role = match &status.role_id {
        Some(id) => format!("<@&{}>", id),
        None => "Not set".to_string(),
    };

    let mut embed = serenity::CreateEmbed::new()
        .title("Subscription Status")
        .field("Current Tier", format!("Tier {}", status.tier), true)
        .field(
            "Subscription Status",
            if status.subscription_active { "Active" } else { "Inactive" },
            true,
        )
        .field("Member Limit", limit, true)
        .field("Verification Role", role, true)
        .color(if status.subscription_active { 0x2ecc71 } else { 0xe74c3c });

    if let Some(count) = member_count {
        embed = embed.field("Current Member Count", count.to_string(), true);
    }
    if let Some(required) = required {
        embed = embed.field("Required Tier", format!("Tier {}", required), true);
        if required > status.tier {
            embed = embed.field(
                "Warning",
                "Your current tier does not cover your server's member count. Please upgrade your subscription.",
                false,
            );
        }
    }
    embed
}

/// Show this server's subscription details
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn subscription_status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a guild")?;
    let service = &ctx.data().service;

    let Some(status) = service.subscription_status(&guild_id.to_string()).await? else {
        return reply(ctx, NOT_CONFIGURED).await;
    };
    let count = member_count(ctx).await;
    let required = count.map(|c| service.required_tier(c));
    let embed = status_embed(&status, count, required, &service.settings().tier_thresholds);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

fn action_label(action: LogAction) -> &'static str {
    match action {
        LogAction::SessionStarted => "Started Verification",
        LogAction::Reverification => "Started Reverification",
        LogAction::Verified => "Verified",
        LogAction::VerificationCanceled => "Verification Canceled",
        LogAction::RoleGranted => "Role Granted",
        LogAction::RoleRevoked => "Role Revoked",
        LogAction::SubscriptionActivated => "Subscription Activated",
        LogAction::SubscriptionDeactivated => "Subscription Deactivated",
    }
}

/// Embed field name and value for one log entry
pub fn log_field(entry: &VerificationLogEntry) -> (String, String) {
    (
        format!(
            "{} - {}",
            action_label(entry.action),
            entry.timestamp.format("%Y-%m-%d %H:%M:%S")
        ),
        format!("User: <@{}>", entry.user_id),
    )
}

/// Show recent verification actions
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn verification_logs(
    ctx: Context<'_>,
    #[description = "Number of entries to show (max 25)"] limit: Option<usize>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a guild")?;
    let logs = match ctx
        .data()
        .service
        .verification_logs(&guild_id.to_string(), limit.unwrap_or(10))
        .await
    {
        Ok(logs) => logs,
        Err(e) => {
            error!("Failed to load verification logs for {}: {}", guild_id, e);
            return reply(ctx, "Failed to load verification logs. Please try again later.").await;
        }
    };

    if logs.is_empty() {
        return reply(ctx, "No verification logs found for this server.").await;
    }

    let mut embed = serenity::CreateEmbed::new()
        .title("Recent Verification Logs")
        .color(0x3498db);
    for entry in &logs {
        let (name, value) = log_field(entry);
        embed = embed.field(name, value, false);
    }

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Get the link to activate a subscription
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn get_subscription(ctx: Context<'_>) -> Result<(), Error> {
    let url = ctx.data().config.pricing_url.clone();
    reply(ctx, format!("To activate a subscription, please visit: {}", url)).await
}
