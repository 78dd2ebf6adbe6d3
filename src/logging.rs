//! Tracing setup shared by every run mode.
//!
//! `RUST_LOG` wins when set. Otherwise `LOG_LEVEL` applies to this crate
//! and dependencies are capped at `warn`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Filter directives for a `LOG_LEVEL` value
pub fn directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let level = if LEVELS.contains(&level.as_str()) {
        level
    } else {
        "info".to_string()
    };
    format!("warn,age_gate={level},webhook_tester={level},tower_http={level}")
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_use_requested_level() {
        assert_eq!(
            directives("DEBUG"),
            "warn,age_gate=debug,webhook_tester=debug,tower_http=debug"
        );
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        assert!(directives("loud").contains("age_gate=info"));
        assert!(EnvFilter::try_new(directives("loud")).is_ok());
    }
}
