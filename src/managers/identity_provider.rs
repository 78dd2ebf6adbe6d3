use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{BotError, Result};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Handle to a provider-hosted verification session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub id: String,
    /// Where the user completes the check
    pub url: String,
}

/// Creates identity verification sessions with the external provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_session(&self, user_id: &str, server_id: &str) -> Result<SessionRef>;
}

pub type SharedIdentityProvider = Arc<dyn IdentityProvider>;

#[derive(Debug, Deserialize)]
struct StripeVerificationSession {
    id: String,
    url: Option<String>,
}

/// Stripe Identity client
pub struct StripeIdentityClient {
    http: reqwest::Client,
    api_key: String,
    api_base_url: String,
}

impl StripeIdentityClient {
    pub fn new(api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            api_key,
            api_base_url: STRIPE_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }
}

/// Form fields for a document check with live capture and a matching selfie.
/// The metadata is echoed back on the webhook and routes the result.
fn session_params(user_id: &str, server_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("type", "document".to_string()),
        ("metadata[userId]", user_id.to_string()),
        ("metadata[serverId]", server_id.to_string()),
        ("options[document][require_id_number]", "false".to_string()),
        ("options[document][require_live_capture]", "true".to_string()),
        ("options[document][require_matching_selfie]", "true".to_string()),
    ]
}

#[async_trait]
impl IdentityProvider for StripeIdentityClient {
    async fn create_session(&self, user_id: &str, server_id: &str) -> Result<SessionRef> {
        let url = format!("{}/v1/identity/verification_sessions", self.api_base_url);

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&session_params(user_id, server_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Stripe create verification session failed ({}): {}", status, body);
            return Err(BotError::IdentityProvider {
                message: format!("Stripe API returned {}", status),
            });
        }

        let session: StripeVerificationSession = response.json().await?;
        let url = session.url.ok_or_else(|| BotError::IdentityProvider {
            message: format!("Verification session {} has no URL", session.id),
        })?;

        info!(
            "Created verification session {} for user {} in guild {}",
            session.id, user_id, server_id
        );
        Ok(SessionRef {
            id: session.id,
            url,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_params_carry_routing_metadata() {
        let params = session_params("42", "7");
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("type"), Some("document"));
        assert_eq!(get("metadata[userId]"), Some("42"));
        assert_eq!(get("metadata[serverId]"), Some("7"));
        assert_eq!(get("options[document][require_matching_selfie]"), Some("true"));
    }

    #[test]
    fn test_session_response_shape() {
        let raw = r#"{"id":"vs_1","object":"identity.verification_session","url":"https://verify.stripe.com/start/abc","status":"requires_input"}"#;
        let session: StripeVerificationSession = serde_json::from_str(raw).unwrap();
        assert_eq!(session.id, "vs_1");
        assert_eq!(session.url.as_deref(), Some("https://verify.stripe.com/start/abc"));
    }
}
