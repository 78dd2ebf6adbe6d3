pub mod consumer;
pub mod cooldown;
pub mod identity_provider;
pub mod locks;
pub mod retry;
pub mod role_manager;
pub mod tier;
pub mod verification_manager;

pub use consumer::{ProcessOutcome, VerificationConsumer};
pub use identity_provider::{IdentityProvider, SessionRef, SharedIdentityProvider, StripeIdentityClient};
pub use locks::KeyedLocks;
pub use role_manager::{DiscordRoleAssigner, RoleAssigner, RoleChange, SharedRoleAssigner};
pub use tier::Tier;
pub use verification_manager::{
    NotConfigured, SharedVerificationService, StartOutcome, VerificationService,
};
