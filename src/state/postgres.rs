//! PostgreSQL implementation of the verification store.
//!
//! Works against the pre-existing `users` / `servers` / `command_usage` tables.
//! `users.discord_id` carries no unique constraint there, so user writes take
//! a transaction-scoped advisory lock on the Discord ID before the
//! update-or-insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use super::models::{LogAction, ServerRecord, UserRecord, VerificationLogEntry};
use super::store::VerificationStore;
use crate::error::Result;
use crate::managers::tier::Tier;

pub struct PostgresStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    discord_id: String,
    username: Option<String>,
    verification_status: Option<bool>,
    last_verification_attempt: Option<DateTime<Utc>>,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            discord_id: row.discord_id,
            username: row.username,
            verified: row.verification_status.unwrap_or(false),
            last_attempt_at: row.last_verification_attempt,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ServerRow {
    server_id: String,
    owner_id: String,
    role_id: Option<String>,
    tier: Option<String>,
    subscription_status: Option<bool>,
}

impl From<ServerRow> for ServerRecord {
    fn from(row: ServerRow) -> Self {
        let tier = row
            .tier
            .as_deref()
            .and_then(Tier::from_code)
            .unwrap_or_default();
        Self {
            server_id: row.server_id,
            owner_id: row.owner_id,
            role_id: row.role_id.filter(|r| !r.is_empty()),
            tier,
            subscription_active: row.subscription_status.unwrap_or(false),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    guild_id: String,
    user_id: String,
    action: String,
    timestamp: DateTime<Utc>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Connected to PostgreSQL and applied migrations");
        Ok(Self::new(pool))
    }

    async fn lock_user(tx: &mut Transaction<'_, Postgres>, discord_id: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(discord_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VerificationStore for PostgresStore {
    async fn get_user(&self, discord_id: &str) -> Result<Option<UserRecord>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT discord_id, username, verification_status, last_verification_attempt
             FROM users WHERE discord_id = $1
             ORDER BY verification_status DESC NULLS LAST, id ASC
             LIMIT 1",
        )
        .bind(discord_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRecord::from))
    }

    async fn record_attempt(
        &self,
        discord_id: &str,
        username: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, discord_id).await?;

        let updated = sqlx::query(
            "UPDATE users
             SET last_verification_attempt = $2, username = COALESCE($3, username)
             WHERE discord_id = $1",
        )
        .bind(discord_id)
        .bind(at)
        .bind(username)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            sqlx::query(
                "INSERT INTO users (discord_id, username, verification_status, last_verification_attempt)
                 VALUES ($1, $2, FALSE, $3)",
            )
            .bind(discord_id)
            .bind(username)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_verified(&self, discord_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, discord_id).await?;

        let updated = sqlx::query(
            "UPDATE users SET verification_status = TRUE
             WHERE discord_id = $1 AND verification_status IS DISTINCT FROM TRUE",
        )
        .bind(discord_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let changed = if updated > 0 {
            true
        } else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE discord_id = $1)")
                    .bind(discord_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if !exists {
                warn!(
                    "Confirmation for user {} without a recorded attempt, creating row",
                    discord_id
                );
                sqlx::query(
                    "INSERT INTO users (discord_id, verification_status) VALUES ($1, TRUE)",
                )
                .bind(discord_id)
                .execute(&mut *tx)
                .await?;
            }
            !exists
        };

        tx.commit().await?;
        Ok(changed)
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>> {
        let row: Option<ServerRow> = sqlx::query_as(
            "SELECT server_id, owner_id, role_id, tier, subscription_status
             FROM servers WHERE server_id = $1",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ServerRecord::from))
    }

    async fn ensure_server(&self, server_id: &str, owner_id: &str) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO servers (server_id, owner_id) VALUES ($1, $2)
             ON CONFLICT (server_id) DO NOTHING",
        )
        .bind(server_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn set_role(&self, server_id: &str, owner_id: &str, role_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO servers (server_id, owner_id, role_id) VALUES ($1, $2, $3)
             ON CONFLICT (server_id) DO UPDATE SET role_id = EXCLUDED.role_id",
        )
        .bind(server_id)
        .bind(owner_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_tier(&self, server_id: &str, tier: Tier) -> Result<bool> {
        let updated = sqlx::query("UPDATE servers SET tier = $2 WHERE server_id = $1")
            .bind(server_id)
            .bind(tier.as_char().to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    async fn set_subscription_active(
        &self,
        server_id: &str,
        owner_id: &str,
        active: bool,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "INSERT INTO servers (server_id, owner_id, subscription_status) VALUES ($1, $2, $3)
             ON CONFLICT (server_id) DO UPDATE SET subscription_status = EXCLUDED.subscription_status
             WHERE servers.subscription_status IS DISTINCT FROM EXCLUDED.subscription_status",
        )
        .bind(server_id)
        .bind(owner_id)
        .bind(active)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn verified_members(&self, server_id: &str, limit: usize) -> Result<Vec<String>> {
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT l.user_id FROM verification_logs l
             WHERE l.guild_id = $1 AND l.action IN ($2, $3)
               AND EXISTS (
                   SELECT 1 FROM users u
                   WHERE u.discord_id = l.user_id AND u.verification_status = TRUE
               )
             GROUP BY l.user_id
             ORDER BY MIN(l.id)
             LIMIT $4",
        )
        .bind(server_id)
        .bind(LogAction::Verified.as_str())
        .bind(LogAction::RoleGranted.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn is_processed(&self, idempotency_key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE idempotency_key = $1)",
        )
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn mark_processed(&self, idempotency_key: &str, event_type: &str) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO processed_events (idempotency_key, event_type) VALUES ($1, $2)
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(idempotency_key)
        .bind(event_type)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn append_log(&self, entry: &VerificationLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO verification_logs (guild_id, user_id, action, timestamp)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.server_id)
        .bind(&entry.user_id)
        .bind(entry.action.as_str())
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_logs(&self, server_id: &str, limit: usize) -> Result<Vec<VerificationLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT guild_id, user_id, action, timestamp FROM verification_logs
             WHERE guild_id = $1
             ORDER BY timestamp DESC, id DESC
             LIMIT $2",
        )
        .bind(server_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match LogAction::parse(&row.action) {
                Some(action) => Some(VerificationLogEntry {
                    server_id: row.guild_id,
                    user_id: row.user_id,
                    action,
                    timestamp: row.timestamp,
                }),
                None => {
                    warn!("Skipping verification log with unknown action '{}'", row.action);
                    None
                }
            })
            .collect())
    }

    async fn record_command_usage(
        &self,
        server_id: &str,
        user_id: &str,
        command: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO command_usage (server_id, user_id, command, timestamp)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(server_id)
        .bind(user_id)
        .bind(command)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
