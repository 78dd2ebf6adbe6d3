use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of provider event carried on the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    VerificationConfirmed,
    SubscriptionUpdated,
    VerificationCanceled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::VerificationConfirmed => "VERIFICATION_CONFIRMED",
            EventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            EventType::VerificationCanceled => "VERIFICATION_CANCELED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker payload published by the webhook receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMessage {
    /// Provider session or event ID; duplicates of the same key are applied once
    pub idempotency_key: String,
    pub event_type: EventType,
    pub user_id: String,
    pub server_id: String,
    pub timestamp: DateTime<Utc>,

    /// New subscription state, only present on `SUBSCRIPTION_UPDATED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_active: Option<bool>,
}

impl VerificationMessage {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_field_names() {
        let raw = r#"{
            "idempotencyKey": "vs_123",
            "eventType": "VERIFICATION_CONFIRMED",
            "userId": "42",
            "serverId": "7",
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;
        let message = VerificationMessage::from_json(raw).unwrap();
        assert_eq!(message.idempotency_key, "vs_123");
        assert_eq!(message.event_type, EventType::VerificationConfirmed);
        assert_eq!(message.subscription_active, None);

        let json = message.to_json().unwrap();
        assert!(json.contains("\"eventType\":\"VERIFICATION_CONFIRMED\""));
        assert!(!json.contains("subscriptionActive"));
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let raw = r#"{"idempotencyKey":"k","eventType":"REFUND","userId":"1","serverId":"2","timestamp":"2024-05-01T12:00:00Z"}"#;
        assert!(VerificationMessage::from_json(raw).is_err());
    }
}
