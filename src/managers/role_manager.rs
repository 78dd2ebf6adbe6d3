use async_trait::async_trait;
use poise::serenity_prelude::{self as serenity, GuildId, Http, RoleId, UserId};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{BotError, Result};

/// What an `ensure_role` call did to the member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Added,
    Removed,
    Unchanged,
    /// The user is not (or no longer) a member of the server
    MemberAbsent,
}

/// Converges a member's role to the desired state.
///
/// Implementations must be idempotent: calling twice with the same arguments
/// leaves the member exactly as one call would.
#[async_trait]
pub trait RoleAssigner: Send + Sync {
    async fn ensure_role(
        &self,
        server_id: &str,
        user_id: &str,
        role_id: &str,
        should_have: bool,
    ) -> Result<RoleChange>;
}

pub type SharedRoleAssigner = Arc<dyn RoleAssigner>;

/// `ensure_role` with an upper bound on how long the platform call may take
pub async fn ensure_role_within(
    roles: &dyn RoleAssigner,
    limit: Duration,
    server_id: &str,
    user_id: &str,
    role_id: &str,
    should_have: bool,
) -> Result<RoleChange> {
    tokio::time::timeout(
        limit,
        roles.ensure_role(server_id, user_id, role_id, should_have),
    )
    .await
    .map_err(|_| BotError::Timeout {
        operation: format!("role update for user {} in guild {}", user_id, server_id),
        seconds: limit.as_secs(),
    })?
}

/// Role assigner backed by the Discord REST API
pub struct DiscordRoleAssigner {
    http: Arc<Http>,
}

impl DiscordRoleAssigner {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

/// Parse a Discord snowflake stored as text
pub fn parse_snowflake(kind: &str, raw: &str) -> Result<NonZeroU64> {
    raw.trim()
        .parse::<NonZeroU64>()
        .map_err(|_| BotError::InvalidConfiguration {
            key: kind.to_string(),
            message: format!("'{}' is not a valid Discord ID", raw),
        })
}

fn is_not_found(err: &serenity::Error) -> bool {
    matches!(
        err,
        serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

#[async_trait]
impl RoleAssigner for DiscordRoleAssigner {
    async fn ensure_role(
        &self,
        server_id: &str,
        user_id: &str,
        role_id: &str,
        should_have: bool,
    ) -> Result<RoleChange> {
        let guild = GuildId::from(parse_snowflake("server_id", server_id)?);
        let user = UserId::from(parse_snowflake("user_id", user_id)?);
        let role = RoleId::from(parse_snowflake("role_id", role_id)?);

        let member = match guild.member(self.http.as_ref(), user).await {
            Ok(member) => member,
            Err(e) if is_not_found(&e) => {
                debug!("User {} is not a member of guild {}", user, guild);
                return Ok(RoleChange::MemberAbsent);
            }
            Err(e) => return Err(e.into()),
        };

        let has_role = member.roles.contains(&role);
        match (has_role, should_have) {
            (false, true) => {
                self.http
                    .add_member_role(guild, user, role, Some("Age verification"))
                    .await?;
                info!("Granted role {} to user {} in guild {}", role, user, guild);
                Ok(RoleChange::Added)
            }
            (true, false) => {
                self.http
                    .remove_member_role(guild, user, role, Some("Subscription inactive"))
                    .await?;
                info!("Removed role {} from user {} in guild {}", role, user, guild);
                Ok(RoleChange::Removed)
            }
            _ => Ok(RoleChange::Unchanged),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};

    /// In-memory role assigner that records every call
    #[derive(Default)]
    pub struct FakeRoleAssigner {
        pub held: Mutex<HashSet<(String, String, String)>>,
        pub calls: Mutex<Vec<(String, String, bool)>>,
        pub absent: Mutex<HashSet<String>>,
        pub failures: Mutex<VecDeque<BotError>>,
        /// Simulated API latency per call
        pub latency: Mutex<Option<std::time::Duration>>,
    }

    impl FakeRoleAssigner {
        pub fn fail_next(&self, err: BotError) {
            self.failures.lock().push_back(err);
        }

        pub fn has_role(&self, server_id: &str, user_id: &str, role_id: &str) -> bool {
            self.held.lock().contains(&(
                server_id.to_string(),
                user_id.to_string(),
                role_id.to_string(),
            ))
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl RoleAssigner for FakeRoleAssigner {
        async fn ensure_role(
            &self,
            server_id: &str,
            user_id: &str,
            role_id: &str,
            should_have: bool,
        ) -> Result<RoleChange> {
            let latency = *self.latency.lock();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.calls
                .lock()
                .push((server_id.to_string(), user_id.to_string(), should_have));
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            if self.absent.lock().contains(user_id) {
                return Ok(RoleChange::MemberAbsent);
            }
            let key = (
                server_id.to_string(),
                user_id.to_string(),
                role_id.to_string(),
            );
            let mut held = self.held.lock();
            Ok(match (held.contains(&key), should_have) {
                (false, true) => {
                    held.insert(key);
                    RoleChange::Added
                }
                (true, false) => {
                    held.remove(&key);
                    RoleChange::Removed
                }
                _ => RoleChange::Unchanged,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRoleAssigner;
    use super::*;

    #[test]
    fn test_parse_snowflake() {
        assert_eq!(
            parse_snowflake("role_id", " 123456789012345678 ").unwrap().get(),
            123456789012345678
        );
        assert!(parse_snowflake("role_id", "0").is_err());
        assert!(parse_snowflake("role_id", "@verified").is_err());
    }

    #[tokio::test]
    async fn test_fake_assigner_is_idempotent() {
        let roles = FakeRoleAssigner::default();
        assert_eq!(
            roles.ensure_role("g1", "u1", "r1", true).await.unwrap(),
            RoleChange::Added
        );
        assert_eq!(
            roles.ensure_role("g1", "u1", "r1", true).await.unwrap(),
            RoleChange::Unchanged
        );
        assert!(roles.has_role("g1", "u1", "r1"));
        assert_eq!(
            roles.ensure_role("g1", "u1", "r1", false).await.unwrap(),
            RoleChange::Removed
        );
        assert!(!roles.has_role("g1", "u1", "r1"));
    }
}
