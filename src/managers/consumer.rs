//! Applies queued provider events to stored state and converges roles.
//!
//! Each message is applied at most once per idempotency key. A message is
//! acked only after its state writes and role calls succeeded; transient
//! failures are retried in place with backoff, then handed back to the
//! broker, and dead-lettered once the broker has delivered it
//! `max_deliveries` times.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{BotError, Result};
use crate::managers::locks::KeyedLocks;
use crate::managers::retry::RetryPolicy;
use crate::managers::role_manager::{ensure_role_within, RoleChange, SharedRoleAssigner};
use crate::queue::{Delivery, EventType, SharedBroker, VerificationMessage};
use crate::state::{LogAction, SharedStore, VerificationLogEntry};

/// Role calls in flight at once during a subscription recomputation
const ROLE_SYNC_CONCURRENCY: usize = 8;
const LOCK_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// What processing a message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied,
    /// The idempotency key was already applied
    Duplicate,
}

pub struct VerificationConsumer {
    broker: SharedBroker,
    store: SharedStore,
    roles: SharedRoleAssigner,
    locks: Arc<KeyedLocks>,
    retry: RetryPolicy,
    config: ConsumerConfig,
    max_deliveries: u32,
}

impl VerificationConsumer {
    pub fn new(
        broker: SharedBroker,
        store: SharedStore,
        roles: SharedRoleAssigner,
        locks: Arc<KeyedLocks>,
        config: ConsumerConfig,
        max_deliveries: u32,
    ) -> Self {
        Self {
            broker,
            store,
            roles,
            locks,
            retry: RetryPolicy::from_config(&config),
            config,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Start the worker tasks
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|worker| {
                let consumer = self.clone();
                tokio::spawn(async move { consumer.worker_loop(worker).await })
            })
            .collect();

        let locks = self.locks.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOCK_PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                locks.prune();
            }
        }));

        info!("Started {} verification consumer workers", self.config.workers.max(1));
        handles
    }

    async fn worker_loop(&self, worker: usize) {
        debug!("Consumer worker {} started", worker);
        loop {
            match self.broker.receive(1).await {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.handle(&delivery).await;
                    }
                }
                Err(e) => {
                    warn!("Worker {} failed to receive from broker: {}", worker, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Process one delivery and settle it with the broker
    pub async fn handle(&self, delivery: &Delivery) {
        let message = &delivery.message;
        let result = self
            .retry
            .run("process message", || self.process_once(message))
            .await;

        let settled = match result {
            Ok(outcome) => {
                debug!(
                    "{} {} ({:?})",
                    message.event_type, message.idempotency_key, outcome
                );
                self.broker.ack(delivery).await
            }
            Err(e) if e.is_transient() && delivery.attempt < self.max_deliveries => {
                warn!(
                    "Transient failure on {} {} (delivery {}/{}), handing back to broker: {}",
                    message.event_type,
                    message.idempotency_key,
                    delivery.attempt,
                    self.max_deliveries,
                    e
                );
                self.broker.nack(delivery).await
            }
            Err(e) => {
                error!(
                    alert = "dead_letter",
                    "Giving up on {} {} for user {} in guild {} after {} deliveries: {}",
                    message.event_type,
                    message.idempotency_key,
                    message.user_id,
                    message.server_id,
                    delivery.attempt,
                    e
                );
                self.broker.dead_letter(delivery, &e.to_string()).await
            }
        };

        if let Err(e) = settled {
            // Unsettled messages come back after the visibility timeout
            warn!("Failed to settle delivery {}: {}", delivery.id, e);
        }
    }

    /// Apply a message once, holding the per-key lock for the duration
    pub async fn process_once(&self, message: &VerificationMessage) -> Result<ProcessOutcome> {
        match message.event_type {
            EventType::VerificationConfirmed => self.apply_confirmation(message).await,
            EventType::SubscriptionUpdated => self.apply_subscription(message).await,
            EventType::VerificationCanceled => self.apply_cancellation(message).await,
        }
    }

    async fn apply_confirmation(&self, message: &VerificationMessage) -> Result<ProcessOutcome> {
        let user_id = message.user_id.as_str();
        let server_id = message.server_id.as_str();
        let _guard = self.locks.lock_member(user_id, server_id).await;

        if self.store.is_processed(&message.idempotency_key).await? {
            return Ok(ProcessOutcome::Duplicate);
        }

        self.store.mark_verified(user_id).await?;

        let server = self.store.get_server(server_id).await?;
        let target = server
            .as_ref()
            .and_then(|s| s.role_id.as_deref().map(|role| (role, s.subscription_active)));
        let change = match target {
            Some((role_id, subscription_active)) => Some(
                ensure_role_within(
                    self.roles.as_ref(),
                    self.config.role_call_timeout,
                    server_id,
                    user_id,
                    role_id,
                    subscription_active,
                )
                .await?,
            ),
            None => {
                warn!(
                    "{}",
                    BotError::MissingConfiguration {
                        message: format!(
                            "guild {} has no verification role, user {} verified without role",
                            server_id, user_id
                        ),
                    }
                );
                None
            }
        };

        self.log(server_id, user_id, LogAction::Verified).await?;
        if change == Some(RoleChange::Added) {
            self.log(server_id, user_id, LogAction::RoleGranted).await?;
        }
        self.store
            .mark_processed(&message.idempotency_key, message.event_type.as_str())
            .await?;

        info!("User {} verified in guild {} ({:?})", user_id, server_id, change);
        Ok(ProcessOutcome::Applied)
    }

    async fn apply_subscription(&self, message: &VerificationMessage) -> Result<ProcessOutcome> {
        let active = message
            .subscription_active
            .ok_or_else(|| BotError::MalformedPayload {
                message: format!(
                    "subscription event {} carries no subscription state",
                    message.idempotency_key
                ),
            })?;
        let server_id = message.server_id.as_str();
        let _guard = self.locks.lock_server(server_id).await;

        if self.store.is_processed(&message.idempotency_key).await? {
            return Ok(ProcessOutcome::Duplicate);
        }

        self.store
            .set_subscription_active(server_id, &message.user_id, active)
            .await?;

        let server = self.store.get_server(server_id).await?;
        if let Some(role_id) = server.as_ref().and_then(|s| s.role_id.as_deref()) {
            let members = self
                .store
                .verified_members(server_id, self.config.subscription_batch_limit)
                .await?;
            if members.len() == self.config.subscription_batch_limit {
                warn!(
                    "Guild {} has at least {} verified members, only the first batch is synced",
                    server_id, self.config.subscription_batch_limit
                );
            }

            let calls: Vec<_> = members
                .iter()
                .map(|user_id| async move {
                    let change = ensure_role_within(
                        self.roles.as_ref(),
                        self.config.role_call_timeout,
                        server_id,
                        user_id,
                        role_id,
                        active,
                    )
                    .await;
                    (user_id, change)
                })
                .collect();
            let results: Vec<(&String, Result<RoleChange>)> = stream::iter(calls)
                .buffer_unordered(ROLE_SYNC_CONCURRENCY)
                .collect()
                .await;

            let mut changed = 0;
            let mut first_error = None;
            for (user_id, result) in results {
                match result {
                    Ok(RoleChange::Added) => {
                        changed += 1;
                        self.log(server_id, user_id, LogAction::RoleGranted).await?;
                    }
                    Ok(RoleChange::Removed) => {
                        changed += 1;
                        self.log(server_id, user_id, LogAction::RoleRevoked).await?;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
            info!(
                "Synced {} verified members of guild {}, {} roles changed",
                members.len(),
                server_id,
                changed
            );
        } else {
            debug!("Guild {} has no verification role, nothing to sync", server_id);
        }

        let action = if active {
            LogAction::SubscriptionActivated
        } else {
            LogAction::SubscriptionDeactivated
        };
        self.log(server_id, &message.user_id, action).await?;
        self.store
            .mark_processed(&message.idempotency_key, message.event_type.as_str())
            .await?;
        Ok(ProcessOutcome::Applied)
    }

    async fn apply_cancellation(&self, message: &VerificationMessage) -> Result<ProcessOutcome> {
        let _guard = self
            .locks
            .lock_member(&message.user_id, &message.server_id)
            .await;

        if self.store.is_processed(&message.idempotency_key).await? {
            return Ok(ProcessOutcome::Duplicate);
        }

        self.log(
            &message.server_id,
            &message.user_id,
            LogAction::VerificationCanceled,
        )
        .await?;
        self.store
            .mark_processed(&message.idempotency_key, message.event_type.as_str())
            .await?;
        info!(
            "Verification canceled for user {} in guild {}",
            message.user_id, message.server_id
        );
        Ok(ProcessOutcome::Applied)
    }

    async fn log(&self, server_id: &str, user_id: &str, action: LogAction) -> Result<()> {
        self.store
            .append_log(&VerificationLogEntry::now(server_id, user_id, action))
            .await
    }
}
