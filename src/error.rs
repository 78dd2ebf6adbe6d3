use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    // Webhook boundary errors
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {message}")]
    MalformedPayload { message: String },

    // Configuration errors
    #[error("Missing configuration: {message}")]
    MissingConfiguration { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfiguration { key: String, message: String },

    // Dependency errors
    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("Migration error: {source}")]
    Migration {
        #[from]
        source: sqlx::migrate::MigrateError,
    },

    #[error("Message broker error: {message}")]
    Broker { message: String },

    #[error("Discord API error: {message}")]
    Discord { message: String, retryable: bool },

    #[error("Identity provider error: {message}")]
    IdentityProvider { message: String },

    #[error("Failed to (de)serialize message: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    // Generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BotError {
    /// Whether redelivering the same work can succeed later.
    ///
    /// Transient failures are nacked and retried; everything else goes to the
    /// dead-letter path.
    pub fn is_transient(&self) -> bool {
        match self {
            BotError::Database { .. } => true,
            BotError::Broker { .. } => true,
            BotError::Timeout { .. } => true,
            BotError::IdentityProvider { .. } => true,
            BotError::Discord { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<serenity::Error> for BotError {
    fn from(err: serenity::Error) -> Self {
        let retryable = match &err {
            serenity::Error::Http(http_err) => match http_err {
                serenity::http::HttpError::UnsuccessfulRequest(response) => {
                    let status = response.status_code.as_u16();
                    status == 429 || status >= 500
                }
                // Transport-level failures (connect, TLS, timeouts) are worth retrying
                serenity::http::HttpError::Request(_) => true,
                _ => false,
            },
            _ => false,
        };
        BotError::Discord {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<redis::RedisError> for BotError {
    fn from(err: redis::RedisError) -> Self {
        BotError::Broker {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::IdentityProvider {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
