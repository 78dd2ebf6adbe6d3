use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::managers::tier::Tier;

/// A row of the `users` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Discord user ID (snowflake as string)
    pub discord_id: String,

    /// Display name, informational only
    pub username: Option<String>,

    pub verified: bool,

    /// Set when a verification session starts, whatever its outcome
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn new(discord_id: impl Into<String>) -> Self {
        Self {
            discord_id: discord_id.into(),
            username: None,
            verified: false,
            last_attempt_at: None,
        }
    }
}

/// A row of the `servers` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Discord guild ID (snowflake as string)
    pub server_id: String,
    pub owner_id: String,

    /// Role granted to verified users; `None` until an admin configures it
    pub role_id: Option<String>,

    pub tier: Tier,
    pub subscription_active: bool,
}

impl ServerRecord {
    pub fn new(server_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            owner_id: owner_id.into(),
            role_id: None,
            tier: Tier::default(),
            subscription_active: false,
        }
    }
}

/// Snapshot returned to the command layer
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    pub tier: Tier,
    pub subscription_active: bool,
    pub role_id: Option<String>,
}

impl From<&ServerRecord> for SubscriptionStatus {
    fn from(server: &ServerRecord) -> Self {
        Self {
            tier: server.tier,
            subscription_active: server.subscription_active,
            role_id: server.role_id.clone(),
        }
    }
}

/// A state transition recorded in `verification_logs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    SessionStarted,
    Reverification,
    Verified,
    VerificationCanceled,
    RoleGranted,
    RoleRevoked,
    SubscriptionActivated,
    SubscriptionDeactivated,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::SessionStarted => "session_started",
            LogAction::Reverification => "reverification",
            LogAction::Verified => "verified",
            LogAction::VerificationCanceled => "verification_canceled",
            LogAction::RoleGranted => "role_granted",
            LogAction::RoleRevoked => "role_revoked",
            LogAction::SubscriptionActivated => "subscription_activated",
            LogAction::SubscriptionDeactivated => "subscription_deactivated",
        }
    }

    /// Entries that place a user among a server's verified members
    pub fn marks_membership(&self) -> bool {
        matches!(self, LogAction::Verified | LogAction::RoleGranted)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session_started" => Some(LogAction::SessionStarted),
            "reverification" => Some(LogAction::Reverification),
            "verified" => Some(LogAction::Verified),
            "verification_canceled" => Some(LogAction::VerificationCanceled),
            "role_granted" => Some(LogAction::RoleGranted),
            "role_revoked" => Some(LogAction::RoleRevoked),
            "subscription_activated" => Some(LogAction::SubscriptionActivated),
            "subscription_deactivated" => Some(LogAction::SubscriptionDeactivated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationLogEntry {
    pub server_id: String,
    pub user_id: String,
    pub action: LogAction,
    pub timestamp: DateTime<Utc>,
}

impl VerificationLogEntry {
    pub fn now(server_id: &str, user_id: &str, action: LogAction) -> Self {
        Self {
            server_id: server_id.to_string(),
            user_id: user_id.to_string(),
            action,
            timestamp: Utc::now(),
        }
    }
}
