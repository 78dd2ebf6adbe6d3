use chrono::Utc;
use tracing::{error, info};

use super::{member_count, reply};
use crate::managers::{NotConfigured, RoleChange, StartOutcome};
use crate::{Context, Error};

pub fn not_configured_message(reason: &NotConfigured) -> String {
    match reason {
        NotConfigured::UnknownServer => "This server is not configured for verification. \
             Please ask an admin to set up the server using `/set_role`."
            .to_string(),
        NotConfigured::RoleNotSet => "The verification role has not been set for this server. \
             Please ask an admin to set up the role using `/set_role`."
            .to_string(),
        NotConfigured::SubscriptionInactive => {
            "This server does not have an active verification subscription.".to_string()
        }
        NotConfigured::TierTooLow {
            subscribed,
            required,
        } => format!(
            "This server's verification subscription (Tier {}) does not cover its member count. \
             Please ask an admin to upgrade to Tier {}.",
            subscribed, required
        ),
    }
}

/// User-facing reply for the outcome of a verification request
pub fn outcome_message(outcome: &StartOutcome) -> String {
    match outcome {
        StartOutcome::SessionStarted(session) => format!(
            "Click the link below to verify your age. This link is private and should not be shared:\n\n{}",
            session.url
        ),
        StartOutcome::AlreadyVerified(RoleChange::MemberAbsent) => {
            "You are already verified.".to_string()
        }
        StartOutcome::AlreadyVerified(_) => {
            "You are already verified. Your role has been assigned.".to_string()
        }
        StartOutcome::CooldownRejected { remaining } => {
            let minutes = (remaining.num_seconds() + 59) / 60;
            format!(
                "You're in a cooldown period. Please wait {} more minute{} before attempting to verify again.",
                minutes,
                if minutes == 1 { "" } else { "s" }
            )
        }
        StartOutcome::NotConfigured(reason) => not_configured_message(reason),
    }
}

#[derive(Clone, Copy)]
enum Flow {
    First,
    Again,
}

async fn run_flow(ctx: Context<'_>, flow: Flow) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return reply(ctx, "This command can only be used in a server.").await;
    };
    ctx.defer_ephemeral().await?;

    let user = ctx.author();
    let server_id = guild_id.to_string();
    let user_id = user.id.to_string();
    let count = member_count(ctx).await;
    let service = &ctx.data().service;

    let result = match flow {
        Flow::First => {
            service
                .start_verification(&user_id, Some(&user.name), &server_id, count, Utc::now())
                .await
        }
        Flow::Again => {
            service
                .reverify(&user_id, Some(&user.name), &server_id, count, Utc::now())
                .await
        }
    };

    match result {
        Ok(outcome) => {
            if let StartOutcome::SessionStarted(session) = &outcome {
                info!(
                    "Created verification session {} for {} in guild {}",
                    session.id, user.name, guild_id
                );
            }
            reply(ctx, outcome_message(&outcome)).await
        }
        Err(e) => {
            error!(
                "Failed to start verification for {} in guild {}: {}",
                user.name, guild_id, e
            );
            reply(
                ctx,
                "Failed to initiate the verification process. Please try again later or contact support.",
            )
            .await
        }
    }
}

/// Start the age verification process
#[poise::command(slash_command, guild_only)]
pub async fn verifyme(ctx: Context<'_>) -> Result<(), Error> {
    run_flow(ctx, Flow::First).await
}

/// Verify your age again
#[poise::command(slash_command, guild_only)]
pub async fn reverify(ctx: Context<'_>) -> Result<(), Error> {
    run_flow(ctx, Flow::Again).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::{SessionRef, Tier};

    #[test]
    fn test_session_link_is_shown() {
        let outcome = StartOutcome::SessionStarted(SessionRef {
            id: "vs_1".to_string(),
            url: "https://verify.example/vs_1".to_string(),
        });
        assert!(outcome_message(&outcome).ends_with("\n\nhttps://verify.example/vs_1"));
    }

    #[test]
    fn test_cooldown_rounds_up_to_minutes() {
        let message = outcome_message(&StartOutcome::CooldownRejected {
            remaining: chrono::Duration::seconds(3599),
        });
        assert!(message.contains("wait 60 more minutes"));

        let message = outcome_message(&StartOutcome::CooldownRejected {
            remaining: chrono::Duration::seconds(5),
        });
        assert!(message.contains("wait 1 more minute "));
    }

    #[test]
    fn test_already_verified_messages() {
        assert!(outcome_message(&StartOutcome::AlreadyVerified(RoleChange::Added))
            .contains("role has been assigned"));
        assert_eq!(
            outcome_message(&StartOutcome::AlreadyVerified(RoleChange::MemberAbsent)),
            "You are already verified."
        );
    }

    #[test]
    fn test_tier_too_low_names_both_tiers() {
        let message = not_configured_message(&NotConfigured::TierTooLow {
            subscribed: Tier::A,
            required: Tier::C,
        });
        assert!(message.contains("(Tier A)"));
        assert!(message.contains("upgrade to Tier C"));
    }
}
