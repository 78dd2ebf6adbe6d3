//! Webhook Tester Binary
//!
//! Sends a signed provider event to a running webhook receiver so the
//! queue and consumer path can be exercised without the real provider.
//!
//! Run with: cargo run --bin webhook-tester -- --user-id 42 --server-id 7
//!
//! Required environment variables:
//! - STRIPE_WEBHOOK_SECRET: The signing secret the receiver verifies against

use chrono::Utc;
use clap::{Parser, ValueEnum};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send a signed test event to the webhook receiver")]
struct Args {
    /// Receiver endpoint
    #[arg(long, default_value = "http://localhost:5431/webhook")]
    url: String,

    #[arg(long, value_enum, default_value_t = TestEvent::Verified)]
    event: TestEvent,

    /// Discord user ID placed in the event metadata
    #[arg(long)]
    user_id: String,

    /// Discord guild ID placed in the event metadata
    #[arg(long)]
    server_id: String,

    /// Object ID; generated when omitted
    #[arg(long)]
    object_id: Option<String>,

    /// Sign with a different secret to check rejection
    #[arg(long)]
    bad_signature: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TestEvent {
    Verified,
    Canceled,
    SubscriptionActive,
    SubscriptionCanceled,
}

impl TestEvent {
    fn event_type(self) -> &'static str {
        match self {
            TestEvent::Verified => "identity.verification_session.verified",
            TestEvent::Canceled => "identity.verification_session.canceled",
            TestEvent::SubscriptionActive => "customer.subscription.updated",
            TestEvent::SubscriptionCanceled => "customer.subscription.deleted",
        }
    }

    fn status(self) -> &'static str {
        match self {
            TestEvent::Verified => "verified",
            TestEvent::Canceled => "canceled",
            TestEvent::SubscriptionActive => "active",
            TestEvent::SubscriptionCanceled => "canceled",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            TestEvent::Verified | TestEvent::Canceled => "vs_test_",
            TestEvent::SubscriptionActive | TestEvent::SubscriptionCanceled => "sub_test_",
        }
    }
}

fn sign(secret: &str, timestamp: i64, payload: &str) -> anyhow::Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid signing secret: {}", e))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();
    let args = Args::parse();

    let secret = std::env::var("STRIPE_WEBHOOK_SECRET")
        .map_err(|_| anyhow::anyhow!("STRIPE_WEBHOOK_SECRET must be set"))?;
    let secret = if args.bad_signature {
        format!("{}_wrong", secret)
    } else {
        secret
    };

    let object_id = args.object_id.clone().unwrap_or_else(|| {
        format!("{}{}", args.event.id_prefix(), uuid::Uuid::new_v4().simple())
    });
    let now = Utc::now().timestamp();
    let payload = json!({
        "id": format!("evt_test_{}", uuid::Uuid::new_v4().simple()),
        "type": args.event.event_type(),
        "created": now,
        "data": {
            "object": {
                "id": object_id,
                "status": args.event.status(),
                "metadata": {
                    "userId": args.user_id,
                    "serverId": args.server_id,
                }
            }
        }
    })
    .to_string();

    info!("Sending {} ({}) to {}", args.event.event_type(), object_id, args.url);

    let response = reqwest::Client::new()
        .post(&args.url)
        .header("Stripe-Signature", sign(&secret, now, &payload)?)
        .header("Content-Type", "application/json")
        .body(payload)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        info!("Receiver answered {}: {}", status, body);
    } else {
        error!("Receiver answered {}: {}", status, body);
    }

    Ok(())
}
