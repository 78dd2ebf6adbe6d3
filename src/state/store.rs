use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::models::{ServerRecord, UserRecord, VerificationLogEntry};
use crate::error::Result;
use crate::managers::tier::Tier;

/// Durable record of users, servers and command usage.
///
/// Users and servers are independent: no method may assume that a user row
/// has a matching server row or the other way round. Every write is a
/// single-row conditional update, and the `bool` results report whether the
/// row actually changed.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn get_user(&self, discord_id: &str) -> Result<Option<UserRecord>>;

    /// Set `last_attempt_at`, creating the user if needed. Never touches `verified`.
    async fn record_attempt(
        &self,
        discord_id: &str,
        username: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Set `verified = true`, creating the user if needed. Leaves
    /// `last_attempt_at` untouched.
    async fn mark_verified(&self, discord_id: &str) -> Result<bool>;

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>>;

    /// Insert a server row with defaults if none exists. Existing rows are left alone.
    async fn ensure_server(&self, server_id: &str, owner_id: &str) -> Result<bool>;

    async fn set_role(&self, server_id: &str, owner_id: &str, role_id: &str) -> Result<()>;

    /// Returns false when the server row does not exist.
    async fn set_tier(&self, server_id: &str, tier: Tier) -> Result<bool>;

    /// Set the subscription flag, creating the server row (owned by
    /// `owner_id`) if it does not exist yet.
    async fn set_subscription_active(
        &self,
        server_id: &str,
        owner_id: &str,
        active: bool,
    ) -> Result<bool>;

    /// Verified users that verified in this server or were granted its role,
    /// at most `limit`.
    async fn verified_members(&self, server_id: &str, limit: usize) -> Result<Vec<String>>;

    async fn is_processed(&self, idempotency_key: &str) -> Result<bool>;

    /// Record the key as applied. Returns false if it was already present.
    async fn mark_processed(&self, idempotency_key: &str, event_type: &str) -> Result<bool>;

    async fn append_log(&self, entry: &VerificationLogEntry) -> Result<()>;

    /// Most recent transitions first.
    async fn recent_logs(&self, server_id: &str, limit: usize) -> Result<Vec<VerificationLogEntry>>;

    async fn record_command_usage(
        &self,
        server_id: &str,
        user_id: &str,
        command: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Shared store handle
pub type SharedStore = Arc<dyn VerificationStore>;
