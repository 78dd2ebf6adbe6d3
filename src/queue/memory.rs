//! In-process broker for single-process deployments and tests.
//!
//! Same contract as the Redis broker: a delivered message stays in flight
//! until acked, and comes back after the visibility timeout otherwise.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Delivery, MessageBroker, VerificationMessage};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: VerificationMessage,
    pub reason: String,
    pub attempts: u32,
}

struct Entry {
    message: VerificationMessage,
    deliveries: u32,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    ready: VecDeque<(String, Entry)>,
    in_flight: HashMap<String, (Entry, Instant)>,
    dead_letters: Vec<DeadLetter>,
}

impl Inner {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((entry, _)) = self.in_flight.remove(&id) {
                debug!("Visibility timeout expired for message {}, requeueing", id);
                self.ready.push_back((id, entry));
            }
        }
    }

    fn take(&mut self, max: usize, deadline: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some((id, mut entry)) = self.ready.pop_front() else {
                break;
            };
            entry.deliveries += 1;
            out.push(Delivery {
                id: id.clone(),
                message: entry.message.clone(),
                attempt: entry.deliveries,
            });
            self.in_flight.insert(id, (entry, deadline));
        }
        out
    }
}

pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Messages not yet acked or dead-lettered
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.clone()
    }

    fn poll(&self, max: usize) -> Vec<Delivery> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.requeue_expired(now);
        inner.take(max, now + self.visibility_timeout)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &VerificationMessage) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = format!("mem-{}", inner.next_id);
            inner.ready.push_back((
                id,
                Entry {
                    message: message.clone(),
                    deliveries: 0,
                },
            ));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let deliveries = self.poll(max);
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }
        let _ = tokio::time::timeout(self.poll_interval, self.notify.notified()).await;
        Ok(self.poll(max))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.inner.lock().in_flight.remove(&delivery.id).is_none() {
            debug!("Ack for message {} that is no longer in flight", delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some((_, deadline)) = inner.in_flight.get_mut(&delivery.id) {
            *deadline = Instant::now() + self.visibility_timeout;
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&delivery.id);
        inner.dead_letters.push(DeadLetter {
            message: delivery.message.clone(),
            reason: reason.to_string(),
            attempts: delivery.attempt,
        });
        Ok(())
    }
}
