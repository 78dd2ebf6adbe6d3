//! Durable, at-least-once channel between the webhook receiver and the
//! verification consumer.

pub mod memory;
pub mod message;
pub mod redis_streams;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

pub use memory::InMemoryBroker;
pub use message::{EventType, VerificationMessage};
pub use redis_streams::RedisStreamBroker;

/// A message handed to a consumer. Stays pending until acked or dead-lettered.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned delivery handle
    pub id: String,
    pub message: VerificationMessage,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: &VerificationMessage) -> Result<()>;

    /// Wait briefly for up to `max` deliveries. Redeliveries of messages whose
    /// visibility timeout expired come first. An empty result is not an error.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give the message back. It is redelivered once its visibility timeout
    /// has passed.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Move the message to the dead-letter path and stop redelivering it.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;
}

pub type SharedBroker = Arc<dyn MessageBroker>;
