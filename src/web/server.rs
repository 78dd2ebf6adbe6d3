//! HTTP receiver for provider webhooks

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::events::{Classified, WebhookEnvelope};
use super::signature::SignatureVerifier;
use crate::config::WebhookConfig;
use crate::managers::retry::RetryPolicy;
use crate::queue::SharedBroker;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    pub broker: SharedBroker,
    pub verifier: Arc<SignatureVerifier>,
    pub publish_retry: RetryPolicy,
}

impl WebhookState {
    pub fn new(broker: SharedBroker, verifier: SignatureVerifier) -> Self {
        Self {
            broker,
            verifier: Arc::new(verifier),
            publish_retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
        }
    }
}

pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/webhook", post(receive_webhook))
        .route("/stripe_webhook", post(receive_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the webhook receiver until the process exits.
/// Uses TLS when both a certificate and a key are configured.
pub async fn start_webhook_server(config: WebhookConfig, broker: SharedBroker) -> anyhow::Result<()> {
    let secret = config
        .signing_secret
        .clone()
        .ok_or_else(|| anyhow::anyhow!("STRIPE_WEBHOOK_SECRET must be set to receive webhooks"))?;
    let state = WebhookState::new(broker, SignatureVerifier::new(secret, config.tolerance));
    let app = webhook_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            if !cert_path.exists() {
                return Err(anyhow::anyhow!(
                    "Certificate file not found: {}",
                    cert_path.display()
                ));
            }
            if !key_path.exists() {
                return Err(anyhow::anyhow!(
                    "Private key file not found: {}",
                    key_path.display()
                ));
            }
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to load TLS certificates: {}\n  Certificate: {}\n  Private key: {}",
                        e,
                        cert_path.display(),
                        key_path.display()
                    )
                })?;
            info!("Webhook receiver listening on https://0.0.0.0:{}", config.port);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            info!("Webhook receiver listening on http://0.0.0.0:{}", config.port);
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await?;
        }
    }

    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

fn reply(status: StatusCode, outcome: &str) -> Response {
    (status, Json(json!({ "status": outcome }))).into_response()
}

/// Verify, classify and enqueue one provider event.
///
/// Answers 200 only once the event is safely on the queue (or deliberately
/// dropped), so the provider keeps retrying anything that was not enqueued.
async fn receive_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state
        .verifier
        .verify(&body, signature, Utc::now().timestamp())
    {
        warn!("Rejected webhook: {}", e);
        return reply(StatusCode::BAD_REQUEST, "invalid_signature");
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Rejected webhook with malformed payload: {}", e);
            return reply(StatusCode::BAD_REQUEST, "malformed_payload");
        }
    };

    let message = match envelope.classify(Utc::now()) {
        Classified::Enqueue(message) => message,
        Classified::Ignored(reason) => {
            info!("Ignoring webhook: {}", reason);
            return reply(StatusCode::OK, "ignored");
        }
        Classified::Unroutable(reason) => {
            warn!("Dropping webhook: {}", reason);
            return reply(StatusCode::OK, "ignored");
        }
    };

    let published = state
        .publish_retry
        .run("publish webhook event", || state.broker.publish(&message))
        .await;
    match published {
        Ok(()) => {
            info!(
                "Enqueued {} {} for user {} in guild {}",
                message.event_type, message.idempotency_key, message.user_id, message.server_id
            );
            reply(StatusCode::OK, "accepted")
        }
        Err(e) => {
            error!(
                "Failed to enqueue {} {}: {}",
                message.event_type, message.idempotency_key, e
            );
            reply(StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BotError, Result};
    use crate::queue::{Delivery, InMemoryBroker, MessageBroker, VerificationMessage};
    use crate::web::signature::signature_header;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "whsec_test";

    const VERIFIED: &str = r#"{
        "id": "evt_1",
        "type": "identity.verification_session.verified",
        "data": {"object": {"id": "vs_1", "metadata": {"userId": "42", "serverId": "7"}}}
    }"#;

    fn state(broker: SharedBroker) -> WebhookState {
        let mut state = WebhookState::new(
            broker,
            SignatureVerifier::new(SECRET, Duration::from_secs(300)),
        );
        state.publish_retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        state
    }

    fn signed_request(path: &str, body: &str, secret: &str) -> Request<Body> {
        let header = signature_header(secret, Utc::now().timestamp(), body.as_bytes());
        Request::builder()
            .method("POST")
            .uri(path)
            .header("Stripe-Signature", header)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_signed_event_is_enqueued() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let app = webhook_router(state(broker.clone()));

        let response = app
            .oneshot(signed_request("/webhook", VERIFIED, SECRET))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let delivery = broker.receive(1).await.unwrap().remove(0);
        assert_eq!(delivery.message.idempotency_key, "vs_1");
        assert_eq!(delivery.message.user_id, "42");
    }

    #[tokio::test]
    async fn test_legacy_path_is_served() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let app = webhook_router(state(broker.clone()));

        let response = app
            .oneshot(signed_request("/stripe_webhook", VERIFIED, SECRET))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(broker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_enqueue() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let app = webhook_router(state(broker.clone()));

        let response = app
            .clone()
            .oneshot(signed_request("/webhook", VERIFIED, "whsec_wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let unsigned = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from(VERIFIED))
            .unwrap();
        let response = app.oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unrecognized_event_is_acknowledged_and_dropped() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let app = webhook_router(state(broker.clone()));
        let body = r#"{"id": "evt_2", "type": "invoice.paid", "data": {"object": {"id": "in_1"}}}"#;

        let response = app
            .oneshot(signed_request("/webhook", body, SECRET))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"status":"ignored"}"#);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let app = webhook_router(state(broker.clone()));

        let response = app
            .oneshot(signed_request("/webhook", "{not json", SECRET))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(broker.pending_count(), 0);
    }

    struct DownBroker;

    #[async_trait]
    impl MessageBroker for DownBroker {
        async fn publish(&self, _message: &VerificationMessage) -> Result<()> {
            Err(BotError::Broker {
                message: "connection refused".to_string(),
            })
        }
        async fn receive(&self, _max: usize) -> Result<Vec<Delivery>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _delivery: &Delivery) -> Result<()> {
            Ok(())
        }
        async fn nack(&self, _delivery: &Delivery) -> Result<()> {
            Ok(())
        }
        async fn dead_letter(&self, _delivery: &Delivery, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broker_outage_returns_503() {
        let app = webhook_router(state(Arc::new(DownBroker)));
        let response = app
            .oneshot(signed_request("/webhook", VERIFIED, SECRET))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let app = webhook_router(state(broker));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
