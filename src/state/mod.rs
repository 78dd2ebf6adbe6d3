pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use models::{
    LogAction, ServerRecord, SubscriptionStatus, UserRecord, VerificationLogEntry,
};
pub use postgres::PostgresStore;
pub use store::{SharedStore, VerificationStore};
