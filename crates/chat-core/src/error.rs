use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the backend.
    RateLimited,
    /// Object storage or local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal client bug or invariant break.
    Internal,
}

/// Stable error payload crossing the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ClientError {
    /// High-level error category.
    pub category: ClientErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ClientError {
    /// Construct a new client error.
    pub fn new(
        category: ClientErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Whether a retry may plausibly succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ClientErrorCategory::Network | ClientErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to client error categories.
pub fn classify_http_status(status: u16) -> ClientErrorCategory {
    match status {
        401 | 403 => ClientErrorCategory::Auth,
        408 | 429 => ClientErrorCategory::RateLimited,
        400..=499 => ClientErrorCategory::Config,
        500..=599 => ClientErrorCategory::Network,
        _ => ClientErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ClientErrorCategory::Auth);
        assert_eq!(classify_http_status(429), ClientErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ClientErrorCategory::Config);
        assert_eq!(classify_http_status(503), ClientErrorCategory::Network);
        assert_eq!(classify_http_status(999), ClientErrorCategory::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ClientError::new(ClientErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn recoverability_is_limited_to_network_and_rate_limit() {
        let network = ClientError::new(ClientErrorCategory::Network, "n", "network");
        let rate = ClientError::new(ClientErrorCategory::RateLimited, "r", "rate");
        let auth = ClientError::new(ClientErrorCategory::Auth, "a", "auth");

        assert!(network.is_recoverable());
        assert!(rate.is_recoverable());
        assert!(!auth.is_recoverable());
    }
}
