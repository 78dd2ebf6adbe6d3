//! Webhook receiver
//!
//! Accepts signed provider callbacks and turns them into queue messages.
//! Runs alongside the Discord bot or as a standalone process.

pub mod events;
pub mod server;
pub mod signature;

pub use server::{start_webhook_server, webhook_router, WebhookState};
pub use signature::SignatureVerifier;
