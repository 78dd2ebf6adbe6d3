//! Process configuration, loaded once from the environment at start-up.
//!
//! Every value here is immutable for the lifetime of the process and is
//! handed to components explicitly behind an `Arc`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BotError, Result};
use crate::managers::tier::{default_thresholds, parse_thresholds, TierThreshold};

/// Settings consumed by the cooldown gate and tier resolver.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub cooldown: chrono::Duration,
    pub tier_thresholds: Vec<TierThreshold>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            cooldown: chrono::Duration::seconds(60),
            tier_thresholds: default_thresholds(),
        }
    }
}

/// Message broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis URL; `None` selects the in-process broker
    pub redis_url: Option<String>,
    pub stream: String,
    pub group: String,
    pub dead_letter_stream: String,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            stream: "verification_results".to_string(),
            group: "verification-consumers".to_string(),
            dead_letter_stream: "verification_results.dead".to_string(),
            visibility_timeout: Duration::from_secs(30),
            max_deliveries: 5,
        }
    }
}

/// Consumer worker and retry settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub role_call_timeout: Duration,
    pub subscription_batch_limit: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            role_call_timeout: Duration::from_secs(10),
            subscription_batch_limit: 500,
        }
    }
}

/// Webhook receiver settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub port: u16,
    pub signing_secret: Option<String>,
    pub tolerance: Duration,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            port: 5431,
            signing_secret: None,
            tolerance: Duration::from_secs(300),
            cert_path: None,
            key_path: None,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub discord_token: Option<String>,
    pub database_url: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub bot_client_id: Option<String>,
    pub pricing_url: String,
    pub log_level: String,
    pub core: CoreSettings,
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub webhook: WebhookConfig,
}

impl AppConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker_defaults = BrokerConfig::default();
        let consumer_defaults = ConsumerConfig::default();
        let webhook_defaults = WebhookConfig::default();

        let tier_thresholds = match get("TIER_THRESHOLDS") {
            Some(raw) => parse_thresholds(&raw)?,
            None => default_thresholds(),
        };

        Ok(Self {
            discord_token: get("DISCORD_TOKEN"),
            database_url: get("DATABASE_URL"),
            stripe_secret_key: get("STRIPE_SECRET_KEY"),
            bot_client_id: get("BOT_CLIENT_ID"),
            pricing_url: get("PRICING_URL")
                .unwrap_or_else(|| "https://esattotech.com/pricing/".to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            core: CoreSettings {
                cooldown: chrono::Duration::seconds(parse_or(&get, "COOLDOWN_SECONDS", 60i64)?),
                tier_thresholds,
            },
            broker: BrokerConfig {
                redis_url: get("REDIS_URL"),
                stream: get("BROKER_STREAM").unwrap_or(broker_defaults.stream),
                group: get("BROKER_GROUP").unwrap_or(broker_defaults.group),
                dead_letter_stream: get("BROKER_DEAD_LETTER_STREAM")
                    .unwrap_or(broker_defaults.dead_letter_stream),
                visibility_timeout: Duration::from_secs(parse_or(
                    &get,
                    "BROKER_VISIBILITY_TIMEOUT_SECS",
                    broker_defaults.visibility_timeout.as_secs(),
                )?),
                max_deliveries: parse_or(&get, "BROKER_MAX_DELIVERIES", broker_defaults.max_deliveries)?,
            },
            consumer: ConsumerConfig {
                workers: parse_or(&get, "CONSUMER_WORKERS", consumer_defaults.workers)?.max(1),
                retry_attempts: parse_or(&get, "ROLE_RETRY_ATTEMPTS", consumer_defaults.retry_attempts)?,
                retry_base_delay: Duration::from_millis(parse_or(
                    &get,
                    "ROLE_RETRY_BASE_MS",
                    consumer_defaults.retry_base_delay.as_millis() as u64,
                )?),
                retry_max_delay: consumer_defaults.retry_max_delay,
                role_call_timeout: Duration::from_secs(parse_or(
                    &get,
                    "ROLE_CALL_TIMEOUT_SECS",
                    consumer_defaults.role_call_timeout.as_secs(),
                )?),
                subscription_batch_limit: parse_or(
                    &get,
                    "SUBSCRIPTION_BATCH_LIMIT",
                    consumer_defaults.subscription_batch_limit,
                )?,
            },
            webhook: WebhookConfig {
                port: parse_or(&get, "WEBHOOK_PORT", webhook_defaults.port)?,
                signing_secret: get("STRIPE_WEBHOOK_SECRET"),
                tolerance: Duration::from_secs(parse_or(
                    &get,
                    "WEBHOOK_TOLERANCE_SECS",
                    webhook_defaults.tolerance.as_secs(),
                )?),
                cert_path: get("TLS_CERT_PATH").map(PathBuf::from),
                key_path: get("TLS_KEY_PATH").map(PathBuf::from),
            },
        })
    }

    pub fn require_discord_token(&self) -> Result<&str> {
        require(self.discord_token.as_deref(), "DISCORD_TOKEN")
    }

    pub fn require_webhook_secret(&self) -> Result<&str> {
        require(self.webhook.signing_secret.as_deref(), "STRIPE_WEBHOOK_SECRET")
    }

    pub fn require_stripe_secret_key(&self) -> Result<&str> {
        require(self.stripe_secret_key.as_deref(), "STRIPE_SECRET_KEY")
    }

    pub fn require_redis_url(&self) -> Result<&str> {
        require(self.broker.redis_url.as_deref(), "REDIS_URL")
    }
}

fn require<'a>(value: Option<&'a str>, key: &str) -> Result<&'a str> {
    value.ok_or_else(|| BotError::MissingConfiguration {
        message: format!("{} environment variable is not set", key),
    })
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| BotError::InvalidConfiguration {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::tier::Tier;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.core.cooldown, chrono::Duration::seconds(60));
        assert_eq!(config.core.tier_thresholds, default_thresholds());
        assert_eq!(config.broker.stream, "verification_results");
        assert_eq!(config.webhook.port, 5431);
        assert!(config.broker.redis_url.is_none());
        assert!(config.require_webhook_secret().is_err());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = config_from(&[
            ("COOLDOWN_SECONDS", "3600"),
            ("TIER_THRESHOLDS", "A:0,B:100"),
            ("CONSUMER_WORKERS", "0"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_abc"),
            ("REDIS_URL", "   "),
        ])
        .unwrap();
        assert_eq!(config.core.cooldown, chrono::Duration::seconds(3600));
        assert_eq!(config.core.tier_thresholds.len(), 2);
        assert_eq!(config.core.tier_thresholds[1].tier, Tier::B);
        assert_eq!(config.consumer.workers, 1);
        assert_eq!(config.require_webhook_secret().unwrap(), "whsec_abc");
        assert!(config.broker.redis_url.is_none());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = config_from(&[("WEBHOOK_PORT", "not-a-port")]).unwrap_err();
        assert!(matches!(err, BotError::InvalidConfiguration { key, .. } if key == "WEBHOOK_PORT"));
    }
}
