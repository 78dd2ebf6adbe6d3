//! Provider event envelopes and their mapping onto queue messages.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::queue::{EventType, VerificationMessage};

/// `{id, type, created, data: {object: {...}}}`
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    /// Provider event ID (`evt_...`)
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

#[derive(Debug, Deserialize)]
pub struct EventObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Routing metadata attached when the session or checkout was created
#[derive(Debug, Default, Deserialize)]
pub struct EventMetadata {
    #[serde(default, rename = "userId", alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default, rename = "serverId", alias = "guild_id", alias = "server_id")]
    pub server_id: Option<String>,
}

/// What the receiver does with an accepted event
#[derive(Debug, PartialEq)]
pub enum Classified {
    Enqueue(VerificationMessage),
    /// Acknowledged without enqueueing
    Ignored(String),
    /// Recognized but missing the IDs needed to route it. Also acknowledged.
    Unroutable(String),
}

/// Subscription states that keep the server's role active
fn is_active_status(status: Option<&str>) -> bool {
    matches!(status, Some("active") | Some("trialing"))
}

impl WebhookEnvelope {
    fn occurred_at(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        self.created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(received_at)
    }

    /// Map the envelope onto a queue message, or explain why it is dropped
    pub fn classify(&self, received_at: DateTime<Utc>) -> Classified {
        let object = &self.data.object;
        let (event_type, subscription_active) = match self.event_type.as_str() {
            "identity.verification_session.verified" => (EventType::VerificationConfirmed, None),
            "identity.verification_session.canceled" => (EventType::VerificationCanceled, None),
            "customer.subscription.created" | "customer.subscription.updated" => (
                EventType::SubscriptionUpdated,
                Some(is_active_status(object.status.as_deref())),
            ),
            "customer.subscription.deleted" => (EventType::SubscriptionUpdated, Some(false)),
            "checkout.session.completed" => (EventType::SubscriptionUpdated, Some(true)),
            other => return Classified::Ignored(format!("unhandled event type {}", other)),
        };

        // Sessions are confirmed once, so the session ID identifies the
        // transition. Subscriptions change many times; use the event ID.
        let idempotency_key = match event_type {
            EventType::SubscriptionUpdated => self.id.clone().or_else(|| {
                object.id.as_ref().map(|id| {
                    format!("{}:{}", id, object.status.as_deref().unwrap_or(&self.event_type))
                })
            }),
            _ => object.id.clone(),
        };
        let Some(idempotency_key) = idempotency_key else {
            return Classified::Unroutable(format!("{} without an object ID", self.event_type));
        };

        let metadata = object.metadata.as_ref();
        let user_id = metadata.and_then(|m| m.user_id.clone());
        let server_id = metadata.and_then(|m| m.server_id.clone());
        let (Some(user_id), Some(server_id)) = (user_id, server_id) else {
            return Classified::Unroutable(format!(
                "{} {} is missing userId/serverId metadata",
                self.event_type, idempotency_key
            ));
        };

        Classified::Enqueue(VerificationMessage {
            idempotency_key,
            event_type,
            user_id,
            server_id,
            timestamp: self.occurred_at(received_at),
            subscription_active,
        })
    }
}
