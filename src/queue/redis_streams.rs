//! Redis Streams broker.
//!
//! Messages are stream entries with a single `payload` field. Consumers read
//! through a consumer group, so an entry stays in the group's pending list
//! until it is acked. Entries idle longer than the visibility timeout are
//! claimed back with `XAUTOCLAIM`, and the pending list's delivery counter
//! becomes the delivery attempt.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{Delivery, MessageBroker, VerificationMessage};
use crate::config::BrokerConfig;
use crate::error::{BotError, Result};

const PAYLOAD_FIELD: &str = "payload";
const STREAM_MAXLEN: usize = 100_000;
const READ_BLOCK_MS: usize = 1_000;

pub struct RedisStreamBroker {
    /// Blocking reads get their own connection so they never stall publishes and acks
    reader: Mutex<MultiplexedConnection>,
    writer: MultiplexedConnection,
    stream: String,
    group: String,
    dead_letter_stream: String,
    consumer: String,
    visibility_timeout_ms: u64,
}

impl RedisStreamBroker {
    pub async fn connect(config: &BrokerConfig, consumer: String) -> Result<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| BotError::MissingConfiguration {
                message: "REDIS_URL is not set".to_string(),
            })?;
        let client = redis::Client::open(url)?;
        let reader = client.get_multiplexed_tokio_connection().await?;
        let writer = client.get_multiplexed_tokio_connection().await?;

        let broker = Self {
            reader: Mutex::new(reader),
            writer,
            stream: config.stream.clone(),
            group: config.group.clone(),
            dead_letter_stream: config.dead_letter_stream.clone(),
            consumer,
            visibility_timeout_ms: config.visibility_timeout.as_millis() as u64,
        };
        broker.ensure_group().await?;
        info!(
            "Connected to Redis stream '{}' as consumer '{}' in group '{}'",
            broker.stream, broker.consumer, broker.group
        );
        Ok(broker)
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut con = self.writer.clone();
        let created: redis::RedisResult<()> = con
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!("Created consumer group '{}'", self.group);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn times_delivered(&self, id: &str) -> Result<u32> {
        let mut con = self.writer.clone();
        let reply: StreamPendingCountReply = con
            .xpending_count(&self.stream, &self.group, id, id, 1)
            .await?;
        Ok(reply
            .ids
            .first()
            .map(|p| p.times_delivered as u32)
            .unwrap_or(1))
    }

    /// Claim entries another delivery left idle past the visibility timeout.
    async fn reclaim_expired(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut con = self.writer.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut con)
            .await?;

        let claimed = parse_claimed(&reply);
        if !claimed.trimmed.is_empty() {
            // Nothing left to deliver; drop them from the pending list
            let acked: i64 = con
                .xack(&self.stream, &self.group, &claimed.trimmed)
                .await?;
            debug!("Acked {} pending entries trimmed from the stream", acked);
        }

        let mut deliveries = Vec::new();
        for (id, payload) in claimed.entries {
            let attempt = self.times_delivered(&id).await?;
            if let Some(delivery) = self.decode(id, payload, attempt).await? {
                deliveries.push(delivery);
            }
        }
        if !deliveries.is_empty() {
            debug!("Reclaimed {} expired deliveries", deliveries.len());
        }
        Ok(deliveries)
    }

    async fn read_new(&self, max: usize) -> Result<Vec<Delivery>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(READ_BLOCK_MS);

        let reply: Option<StreamReadReply> = {
            let mut con = self.reader.lock().await;
            con.xread_options(&[&self.stream], &[">"], &options).await?
        };

        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let payload: Option<String> = entry.get(PAYLOAD_FIELD);
                if let Some(delivery) = self.decode(entry.id, payload, 1).await? {
                    deliveries.push(delivery);
                }
            }
        }
        Ok(deliveries)
    }

    /// Turn a raw entry into a delivery. Entries that cannot be decoded are
    /// moved straight to the dead-letter stream.
    async fn decode(
        &self,
        id: String,
        payload: Option<String>,
        attempt: u32,
    ) -> Result<Option<Delivery>> {
        let raw = payload.unwrap_or_default();
        match VerificationMessage::from_json(&raw) {
            Ok(message) => Ok(Some(Delivery {
                id,
                message,
                attempt,
            })),
            Err(e) => {
                error!(alert = "dead_letter", "Undecodable stream entry {}: {}", id, e);
                let reason = format!("undecodable payload: {}", e);
                let mut con = self.writer.clone();
                let _: String = con
                    .xadd(
                        &self.dead_letter_stream,
                        "*",
                        &[
                            (PAYLOAD_FIELD, raw.as_str()),
                            ("reason", reason.as_str()),
                            ("source_id", id.as_str()),
                        ],
                    )
                    .await?;
                let _: i64 = con.xack(&self.stream, &self.group, &[&id]).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn publish(&self, message: &VerificationMessage) -> Result<()> {
        let payload = message.to_json()?;
        let mut con = self.writer.clone();
        let id: String = con
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[(PAYLOAD_FIELD, payload.as_str())],
            )
            .await?;
        debug!(
            "Published {} for key {} as {}",
            message.event_type, message.idempotency_key, id
        );
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let reclaimed = self.reclaim_expired(max).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }
        self.read_new(max).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut con = self.writer.clone();
        let acked: i64 = con.xack(&self.stream, &self.group, &[&delivery.id]).await?;
        if acked == 0 {
            debug!("Entry {} was already acked", delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        // The entry stays in the pending list and is reclaimed once idle long enough
        debug!(
            "Leaving entry {} pending for redelivery (attempt {})",
            delivery.id, delivery.attempt
        );
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let payload = delivery.message.to_json()?;
        let attempts = delivery.attempt.to_string();
        let mut con = self.writer.clone();
        let _: String = con
            .xadd(
                &self.dead_letter_stream,
                "*",
                &[
                    (PAYLOAD_FIELD, payload.as_str()),
                    ("reason", reason),
                    ("source_id", delivery.id.as_str()),
                    ("attempts", attempts.as_str()),
                ],
            )
            .await?;
        let _: i64 = con.xack(&self.stream, &self.group, &[&delivery.id]).await?;
        warn!(
            "Moved entry {} to '{}' after {} attempts",
            delivery.id, self.dead_letter_stream, delivery.attempt
        );
        Ok(())
    }
}

/// Entries taken over by an `XAUTOCLAIM` call
#[derive(Debug, Default, PartialEq)]
pub struct Claimed {
    /// `(entry id, payload)` of entries that still exist
    pub entries: Vec<(String, Option<String>)>,
    /// Pending IDs whose entry was trimmed from the stream
    pub trimmed: Vec<String>,
}

/// Parse an `XAUTOCLAIM` reply.
///
/// The reply is `[next-cursor, [[id, [field, value, ...]], ...], deleted-ids?]`.
/// Redis 7 lists trimmed entries in `deleted-ids` and drops them from the
/// pending list itself. Redis 6.2 returns them in place with nil fields; those
/// IDs are collected in `trimmed` so the caller can ack them. Bare nil
/// elements carry no ID and are skipped, so Redis 6.2 deployments that trim
/// the stream below its pending entries should upgrade to Redis 7.
pub fn parse_claimed(reply: &Value) -> Claimed {
    let mut claimed = Claimed::default();
    let entries = match reply {
        Value::Bulk(parts) => match parts.get(1) {
            Some(Value::Bulk(entries)) => entries,
            _ => return claimed,
        },
        _ => return claimed,
    };

    for entry in entries {
        let Value::Bulk(pair) = entry else {
            continue;
        };
        let id = match pair.first() {
            Some(Value::Data(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            _ => continue,
        };
        match pair.get(1) {
            Some(Value::Bulk(fields)) => {
                let payload = fields.chunks(2).find_map(|kv| match kv {
                    [Value::Data(k), Value::Data(v)] if k.as_slice() == PAYLOAD_FIELD.as_bytes() => {
                        Some(String::from_utf8_lossy(v).into_owned())
                    }
                    _ => None,
                });
                claimed.entries.push((id, payload));
            }
            None | Some(Value::Nil) => claimed.trimmed.push(id),
            Some(_) => claimed.entries.push((id, None)),
        }
    }
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_claimed_extracts_payloads() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    data("1700000000000-0"),
                    Value::Bulk(vec![data("payload"), data("{\"a\":1}")]),
                ]),
                Value::Bulk(vec![
                    data("1700000000001-0"),
                    Value::Bulk(vec![data("other"), data("x")]),
                ]),
            ]),
            Value::Bulk(vec![]),
        ]);

        let claimed = parse_claimed(&reply).entries;
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].0, "1700000000000-0");
        assert_eq!(claimed[0].1.as_deref(), Some("{\"a\":1}"));
        assert_eq!(claimed[1].1, None);
    }

    #[test]
    fn test_parse_claimed_separates_trimmed_entries() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![
                Value::Nil,
                Value::Bulk(vec![data("4-0"), Value::Nil]),
                Value::Bulk(vec![
                    data("5-0"),
                    Value::Bulk(vec![data("payload"), data("{}")]),
                ]),
            ]),
        ]);

        let claimed = parse_claimed(&reply);
        assert_eq!(claimed.entries, vec![("5-0".to_string(), Some("{}".to_string()))]);
        assert_eq!(claimed.trimmed, vec!["4-0".to_string()]);
    }

    #[test]
    fn test_parse_claimed_handles_unexpected_shapes() {
        assert_eq!(parse_claimed(&Value::Nil), Claimed::default());
        assert_eq!(parse_claimed(&Value::Bulk(vec![data("0-0")])), Claimed::default());
    }
}
