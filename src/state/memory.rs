//! In-process store used by tests and by runs without `DATABASE_URL`.
//!
//! Nothing here survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::models::{ServerRecord, UserRecord, VerificationLogEntry};
use super::store::VerificationStore;
use crate::error::Result;
use crate::managers::tier::Tier;
use crate::state::models::LogAction;

#[derive(Debug, Clone)]
pub struct CommandUsage {
    pub server_id: String,
    pub user_id: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    servers: HashMap<String, ServerRecord>,
    processed: HashSet<String>,
    logs: Vec<VerificationLogEntry>,
    command_usage: Vec<CommandUsage>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a server row
    pub fn insert_server(&self, server: ServerRecord) {
        self.tables
            .write()
            .servers
            .insert(server.server_id.clone(), server);
    }

    /// Seed or replace a user row
    pub fn insert_user(&self, user: UserRecord) {
        self.tables
            .write()
            .users
            .insert(user.discord_id.clone(), user);
    }

    pub fn command_usage(&self) -> Vec<CommandUsage> {
        self.tables.read().command_usage.clone()
    }
}

#[async_trait]
impl VerificationStore for InMemoryStore {
    async fn get_user(&self, discord_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().users.get(discord_id).cloned())
    }

    async fn record_attempt(
        &self,
        discord_id: &str,
        username: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let user = tables
            .users
            .entry(discord_id.to_string())
            .or_insert_with(|| UserRecord::new(discord_id));
        user.last_attempt_at = Some(at);
        if let Some(name) = username {
            user.username = Some(name.to_string());
        }
        Ok(())
    }

    async fn mark_verified(&self, discord_id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let user = tables
            .users
            .entry(discord_id.to_string())
            .or_insert_with(|| UserRecord::new(discord_id));
        let changed = !user.verified;
        user.verified = true;
        Ok(changed)
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>> {
        Ok(self.tables.read().servers.get(server_id).cloned())
    }

    async fn ensure_server(&self, server_id: &str, owner_id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.servers.contains_key(server_id) {
            return Ok(false);
        }
        tables
            .servers
            .insert(server_id.to_string(), ServerRecord::new(server_id, owner_id));
        Ok(true)
    }

    async fn set_role(&self, server_id: &str, owner_id: &str, role_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let server = tables
            .servers
            .entry(server_id.to_string())
            .or_insert_with(|| ServerRecord::new(server_id, owner_id));
        server.role_id = Some(role_id.to_string());
        Ok(())
    }

    async fn set_tier(&self, server_id: &str, tier: Tier) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.servers.get_mut(server_id) {
            Some(server) => {
                server.tier = tier;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_subscription_active(
        &self,
        server_id: &str,
        owner_id: &str,
        active: bool,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let server = tables
            .servers
            .entry(server_id.to_string())
            .or_insert_with(|| ServerRecord::new(server_id, owner_id));
        let changed = server.subscription_active != active;
        server.subscription_active = active;
        Ok(changed)
    }

    async fn verified_members(&self, server_id: &str, limit: usize) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let mut seen = HashSet::new();
        let members = tables
            .logs
            .iter()
            .filter(|e| e.server_id == server_id && e.action.marks_membership())
            .filter(|e| {
                tables
                    .users
                    .get(&e.user_id)
                    .map(|u| u.verified)
                    .unwrap_or(false)
            })
            .filter(|e| seen.insert(e.user_id.clone()))
            .map(|e| e.user_id.clone())
            .take(limit)
            .collect();
        Ok(members)
    }

    async fn is_processed(&self, idempotency_key: &str) -> Result<bool> {
        Ok(self.tables.read().processed.contains(idempotency_key))
    }

    async fn mark_processed(&self, idempotency_key: &str, _event_type: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .processed
            .insert(idempotency_key.to_string()))
    }

    async fn append_log(&self, entry: &VerificationLogEntry) -> Result<()> {
        self.tables.write().logs.push(entry.clone());
        Ok(())
    }

    async fn recent_logs(&self, server_id: &str, limit: usize) -> Result<Vec<VerificationLogEntry>> {
        let tables = self.tables.read();
        let mut entries: Vec<VerificationLogEntry> = tables
            .logs
            .iter()
            .filter(|e| e.server_id == server_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse gives newest first
        entries.sort_by_key(|e| e.timestamp);
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    async fn record_command_usage(
        &self,
        server_id: &str,
        user_id: &str,
        command: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.tables.write().command_usage.push(CommandUsage {
            server_id: server_id.to_string(),
            user_id: user_id.to_string(),
            command: command.to_string(),
            timestamp: at,
        });
        Ok(())
    }
}
