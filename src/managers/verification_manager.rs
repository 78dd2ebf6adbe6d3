use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CoreSettings;
use crate::error::Result;
use crate::managers::cooldown::can_attempt;
use crate::managers::identity_provider::{SessionRef, SharedIdentityProvider};
use crate::managers::locks::KeyedLocks;
use crate::managers::role_manager::{ensure_role_within, RoleChange, SharedRoleAssigner};
use crate::managers::tier::{resolve_tier, Tier};
use crate::state::{
    LogAction, ServerRecord, SharedStore, SubscriptionStatus, VerificationLogEntry,
};

/// Most log entries returned in one request
pub const MAX_LOG_LIMIT: usize = 25;

/// Why a server cannot run verifications yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotConfigured {
    UnknownServer,
    RoleNotSet,
    SubscriptionInactive,
    /// The subscribed tier does not cover the server's member count
    TierTooLow { subscribed: Tier, required: Tier },
}

/// Result of a verification or re-verification request
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    SessionStarted(SessionRef),
    /// Already verified; the role was converged instead of starting a session
    AlreadyVerified(RoleChange),
    CooldownRejected { remaining: chrono::Duration },
    NotConfigured(NotConfigured),
}

/// Operations the command layer performs against verification state
pub struct VerificationService {
    store: SharedStore,
    roles: SharedRoleAssigner,
    identity: SharedIdentityProvider,
    locks: Arc<KeyedLocks>,
    settings: CoreSettings,
    role_call_timeout: Duration,
}

impl VerificationService {
    pub fn new(
        store: SharedStore,
        roles: SharedRoleAssigner,
        identity: SharedIdentityProvider,
        locks: Arc<KeyedLocks>,
        settings: CoreSettings,
        role_call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            roles,
            identity,
            locks,
            settings,
            role_call_timeout,
        }
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    /// Tier a server of this size needs
    pub fn required_tier(&self, member_count: u64) -> Tier {
        resolve_tier(member_count, &self.settings.tier_thresholds)
    }

    /// Check that the server can run verifications and return its role
    fn check_ready(
        &self,
        server: Option<ServerRecord>,
        member_count: Option<u64>,
    ) -> std::result::Result<(ServerRecord, String), NotConfigured> {
        let server = server.ok_or(NotConfigured::UnknownServer)?;
        let role_id = server.role_id.clone().ok_or(NotConfigured::RoleNotSet)?;
        if !server.subscription_active {
            return Err(NotConfigured::SubscriptionInactive);
        }
        if let Some(count) = member_count {
            let required = self.required_tier(count);
            if server.tier < required {
                return Err(NotConfigured::TierTooLow {
                    subscribed: server.tier,
                    required,
                });
            }
        }
        Ok((server, role_id))
    }

    /// Start a first verification. Users already verified get their role
    /// back without a new session.
    pub async fn start_verification(
        &self,
        user_id: &str,
        username: Option<&str>,
        server_id: &str,
        member_count: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let server = self.store.get_server(server_id).await?;
        let (server, role_id) = match self.check_ready(server, member_count) {
            Ok(ready) => ready,
            Err(reason) => {
                debug!("Guild {} cannot verify yet: {:?}", server_id, reason);
                return Ok(StartOutcome::NotConfigured(reason));
            }
        };

        let _guard = self.locks.lock_member(user_id, server_id).await;
        let user = self.store.get_user(user_id).await?;

        if let Some(user) = user.as_ref().filter(|u| u.verified) {
            info!("User {} is already verified, converging role", user.discord_id);
            let change = ensure_role_within(
                self.roles.as_ref(),
                self.role_call_timeout,
                server_id,
                user_id,
                &role_id,
                server.subscription_active,
            )
            .await?;
            if change == RoleChange::Added {
                self.store
                    .append_log(&VerificationLogEntry::now(
                        server_id,
                        user_id,
                        LogAction::RoleGranted,
                    ))
                    .await?;
            }
            return Ok(StartOutcome::AlreadyVerified(change));
        }

        let last_attempt = user.and_then(|u| u.last_attempt_at);
        self.begin_session(user_id, username, server_id, last_attempt, now, LogAction::SessionStarted)
            .await
    }

    /// Start a fresh session for a user who may already be verified.
    ///
    /// Always cooldown-gated. The current `verified` flag and role stay in
    /// place until a new confirmation arrives.
    pub async fn reverify(
        &self,
        user_id: &str,
        username: Option<&str>,
        server_id: &str,
        member_count: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let server = self.store.get_server(server_id).await?;
        if let Err(reason) = self.check_ready(server, member_count) {
            return Ok(StartOutcome::NotConfigured(reason));
        }

        let _guard = self.locks.lock_member(user_id, server_id).await;
        let last_attempt = self
            .store
            .get_user(user_id)
            .await?
            .and_then(|u| u.last_attempt_at);
        self.begin_session(user_id, username, server_id, last_attempt, now, LogAction::Reverification)
            .await
    }

    async fn begin_session(
        &self,
        user_id: &str,
        username: Option<&str>,
        server_id: &str,
        last_attempt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        action: LogAction,
    ) -> Result<StartOutcome> {
        let decision = can_attempt(last_attempt, now, self.settings.cooldown);
        if !decision.allowed {
            debug!(
                "User {} is in cooldown for another {}s",
                user_id,
                decision.remaining.num_seconds()
            );
            return Ok(StartOutcome::CooldownRejected {
                remaining: decision.remaining,
            });
        }

        let session = self.identity.create_session(user_id, server_id).await?;
        self.store.record_attempt(user_id, username, now).await?;
        self.store
            .append_log(&VerificationLogEntry {
                server_id: server_id.to_string(),
                user_id: user_id.to_string(),
                action,
                timestamp: now,
            })
            .await?;

        Ok(StartOutcome::SessionStarted(session))
    }

    /// Set the verified role, creating the server row if needed
    pub async fn set_role(&self, server_id: &str, owner_id: &str, role_id: &str) -> Result<()> {
        self.store.set_role(server_id, owner_id, role_id).await?;
        info!("Verification role for guild {} set to {}", server_id, role_id);
        Ok(())
    }

    /// Returns false when the server is not registered
    pub async fn set_tier(&self, server_id: &str, tier: Tier) -> Result<bool> {
        let updated = self.store.set_tier(server_id, tier).await?;
        if updated {
            info!("Tier for guild {} set to {}", server_id, tier);
        }
        Ok(updated)
    }

    /// Recompute and store the tier from the current member count
    pub async fn recompute_tier(&self, server_id: &str, member_count: u64) -> Result<Option<Tier>> {
        let tier = self.required_tier(member_count);
        if self.set_tier(server_id, tier).await? {
            Ok(Some(tier))
        } else {
            Ok(None)
        }
    }

    pub async fn subscription_status(&self, server_id: &str) -> Result<Option<SubscriptionStatus>> {
        Ok(self
            .store
            .get_server(server_id)
            .await?
            .as_ref()
            .map(SubscriptionStatus::from))
    }

    /// Most recent transitions for a server, newest first
    pub async fn verification_logs(
        &self,
        server_id: &str,
        limit: usize,
    ) -> Result<Vec<VerificationLogEntry>> {
        self.store
            .recent_logs(server_id, limit.clamp(1, MAX_LOG_LIMIT))
            .await
    }

    /// Register a guild the bot joined
    pub async fn register_server(&self, server_id: &str, owner_id: &str) -> Result<()> {
        if self.store.ensure_server(server_id, owner_id).await? {
            info!("Registered guild {} (owner {})", server_id, owner_id);
        }
        Ok(())
    }

    /// Converge the role of a member who just joined
    pub async fn sync_member(&self, server_id: &str, user_id: &str) -> Result<Option<RoleChange>> {
        let Some(server) = self.store.get_server(server_id).await? else {
            return Ok(None);
        };
        let Some(role_id) = server.role_id.as_deref() else {
            return Ok(None);
        };

        let _guard = self.locks.lock_member(user_id, server_id).await;
        let verified = self
            .store
            .get_user(user_id)
            .await?
            .map(|u| u.verified)
            .unwrap_or(false);
        if !verified {
            return Ok(None);
        }

        let change = ensure_role_within(
            self.roles.as_ref(),
            self.role_call_timeout,
            server_id,
            user_id,
            role_id,
            server.subscription_active,
        )
        .await?;
        if change == RoleChange::Added {
            self.store
                .append_log(&VerificationLogEntry::now(
                    server_id,
                    user_id,
                    LogAction::RoleGranted,
                ))
                .await?;
        }
        Ok(Some(change))
    }

    /// Append a command usage record. Failures are logged, never surfaced.
    pub async fn record_command(&self, server_id: &str, user_id: &str, command: &str) {
        if let Err(e) = self
            .store
            .record_command_usage(server_id, user_id, command, Utc::now())
            .await
        {
            warn!("Failed to record usage of /{}: {}", command, e);
        }
    }
}

pub type SharedVerificationService = Arc<VerificationService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::identity_provider::fake::FakeIdentityProvider;
    use crate::managers::role_manager::fake::FakeRoleAssigner;
    use crate::state::{InMemoryStore, UserRecord, VerificationStore};
    use chrono::TimeZone;

    struct Harness {
        store: Arc<InMemoryStore>,
        roles: Arc<FakeRoleAssigner>,
        identity: Arc<FakeIdentityProvider>,
        service: VerificationService,
    }

    fn harness(cooldown_secs: i64) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let roles = Arc::new(FakeRoleAssigner::default());
        let identity = Arc::new(FakeIdentityProvider::default());
        let settings = CoreSettings {
            cooldown: chrono::Duration::seconds(cooldown_secs),
            ..CoreSettings::default()
        };
        let service = VerificationService::new(
            store.clone(),
            roles.clone(),
            identity.clone(),
            Arc::new(KeyedLocks::new()),
            settings,
            Duration::from_secs(5),
        );
        Harness {
            store,
            roles,
            identity,
            service,
        }
    }

    fn ready_server() -> ServerRecord {
        ServerRecord {
            role_id: Some("r1".to_string()),
            subscription_active: true,
            ..ServerRecord::new("g1", "owner")
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_first_attempt_starts_session_and_records_attempt() {
        let h = harness(3600);
        h.store.insert_server(ready_server());

        let outcome = h
            .service
            .start_verification("u1", Some("alice"), "g1", Some(10), t0())
            .await
            .unwrap();

        assert!(matches!(outcome, StartOutcome::SessionStarted(_)));
        let user = h.store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.last_attempt_at, Some(t0()));
        assert!(!user.verified);
        assert_eq!(h.identity.created.lock().len(), 1);

        let logs = h.service.verification_logs("g1", 10).await.unwrap();
        assert_eq!(logs[0].action, LogAction::SessionStarted);
    }

    #[tokio::test]
    async fn test_unconfigured_server_is_reported() {
        let h = harness(60);
        let outcome = h
            .service
            .start_verification("u1", None, "g1", None, t0())
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::NotConfigured(NotConfigured::UnknownServer));

        h.store.insert_server(ServerRecord::new("g1", "owner"));
        let outcome = h
            .service
            .start_verification("u1", None, "g1", None, t0())
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::NotConfigured(NotConfigured::RoleNotSet));

        h.store.insert_server(ServerRecord {
            role_id: Some("r1".to_string()),
            ..ServerRecord::new("g1", "owner")
        });
        let outcome = h
            .service
            .start_verification("u1", None, "g1", None, t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::NotConfigured(NotConfigured::SubscriptionInactive)
        );
        assert!(h.identity.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tier_must_cover_member_count() {
        let h = harness(60);
        h.store.insert_server(ready_server());

        let outcome = h
            .service
            .start_verification("u1", None, "g1", Some(600), t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::NotConfigured(NotConfigured::TierTooLow {
                subscribed: Tier::A,
                required: Tier::C,
            })
        );
    }

    #[tokio::test]
    async fn test_already_verified_user_gets_role_without_session() {
        let h = harness(3600);
        h.store.insert_server(ready_server());
        h.store.insert_user(UserRecord {
            verified: true,
            last_attempt_at: Some(t0()),
            ..UserRecord::new("u1")
        });

        let outcome = h
            .service
            .start_verification("u1", None, "g1", None, t0() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(outcome, StartOutcome::AlreadyVerified(RoleChange::Added));
        assert!(h.roles.has_role("g1", "u1", "r1"));
        assert!(h.identity.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reverify_inside_cooldown_is_rejected() {
        let h = harness(3600);
        h.store.insert_server(ready_server());
        h.store.insert_user(UserRecord {
            verified: true,
            last_attempt_at: Some(t0()),
            ..UserRecord::new("u1")
        });

        let outcome = h
            .service
            .reverify("u1", None, "g1", None, t0() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StartOutcome::CooldownRejected {
                remaining: chrono::Duration::seconds(3599)
            }
        );
        let user = h.store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.last_attempt_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_reverify_keeps_verified_flag() {
        let h = harness(60);
        h.store.insert_server(ready_server());
        h.store.insert_user(UserRecord {
            verified: true,
            last_attempt_at: Some(t0()),
            ..UserRecord::new("u1")
        });

        let later = t0() + chrono::Duration::seconds(120);
        let outcome = h.service.reverify("u1", None, "g1", None, later).await.unwrap();

        assert!(matches!(outcome, StartOutcome::SessionStarted(_)));
        let user = h.store.get_user("u1").await.unwrap().unwrap();
        assert!(user.verified);
        assert_eq!(user.last_attempt_at, Some(later));
    }

    #[tokio::test]
    async fn test_provider_failure_does_not_record_attempt() {
        let h = harness(60);
        h.store.insert_server(ready_server());
        *h.identity.fail.lock() = true;

        let result = h
            .service
            .start_verification("u1", None, "g1", None, t0())
            .await;

        assert!(result.unwrap_err().is_transient());
        assert!(h.store.get_user("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recompute_tier_uses_thresholds() {
        let h = harness(60);
        assert_eq!(h.service.recompute_tier("g1", 300).await.unwrap(), None);

        h.store.insert_server(ready_server());
        assert_eq!(
            h.service.recompute_tier("g1", 300).await.unwrap(),
            Some(Tier::B)
        );
        let status = h.service.subscription_status("g1").await.unwrap().unwrap();
        assert_eq!(status.tier, Tier::B);
        assert!(status.subscription_active);
        assert_eq!(status.role_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_sync_member_only_touches_verified_users() {
        let h = harness(60);
        h.store.insert_server(ready_server());

        assert_eq!(h.service.sync_member("g1", "u1").await.unwrap(), None);
        assert_eq!(h.roles.call_count(), 0);

        h.store.insert_user(UserRecord {
            verified: true,
            ..UserRecord::new("u1")
        });
        assert_eq!(
            h.service.sync_member("g1", "u1").await.unwrap(),
            Some(RoleChange::Added)
        );
    }

    #[tokio::test]
    async fn test_roles_granted_outside_confirmation_count_as_members() {
        let h = harness(3600);
        h.store.insert_server(ready_server());
        for user in ["u1", "u2"] {
            h.store.insert_user(UserRecord {
                verified: true,
                ..UserRecord::new(user)
            });
        }

        let outcome = h
            .service
            .start_verification("u1", None, "g1", None, t0())
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyVerified(RoleChange::Added));
        assert_eq!(
            h.service.sync_member("g1", "u2").await.unwrap(),
            Some(RoleChange::Added)
        );

        let logs = h.service.verification_logs("g1", 10).await.unwrap();
        assert!(logs.iter().all(|l| l.action == LogAction::RoleGranted));
        let mut members = h.store.verified_members("g1", 10).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_record_command_appends_usage() {
        let h = harness(60);
        h.service.record_command("g1", "u1", "verifyme").await;
        let usage = h.store.command_usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].command, "verifyme");
    }
}
