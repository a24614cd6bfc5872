//! Error types for the delivery pipeline.
//!
//! Covers the failure taxonomy of the queue: transient send failures that
//! consume retry budget, permanent failures after exhaustion, missing or
//! invalid webhook configuration, and infrastructure failures that bubble
//! to the caller. Malformed persisted data is handled as a logged warning
//! at the persistence boundary and never surfaces here.

use relay_core::{CoreError, WebhookId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error type for delivery pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The sender collaborator reported a failed attempt.
    ///
    /// Counts against the delivery's retry budget; the retry policy alone
    /// decides retry versus terminal fate, regardless of failure subclass.
    #[error("webhook send failed: {message}")]
    SendFailed {
        /// Description of the failed attempt.
        message: String,
    },

    /// All retry attempts exhausted; the delivery is terminally failed.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts consumed before giving up.
        attempts: i32,
    },

    /// No active webhook configuration for the target endpoint.
    #[error("no webhook config for {webhook_id}")]
    MissingConfig {
        /// The unresolvable webhook id.
        webhook_id: WebhookId,
    },

    /// Webhook configuration exists but is unusable.
    #[error("invalid webhook configuration: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Database or connection failure on a foreground call.
    ///
    /// Propagated to the caller; background loops catch and log these.
    #[error("database error: {message}")]
    Database {
        /// Underlying failure description.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a send-failure error from a message.
    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::SendFailed { message: message.into() }
    }

    /// Creates a retries-exhausted error.
    pub fn retries_exhausted(attempts: i32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a missing-config error.
    pub fn missing_config(webhook_id: WebhookId) -> Self {
        Self::MissingConfig { webhook_id }
    }

    /// Creates a configuration error from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a database error from a message.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = DeliveryError::send_failed("connection refused");
        assert_eq!(err.to_string(), "webhook send failed: connection refused");

        let err = DeliveryError::retries_exhausted(3);
        assert_eq!(err.to_string(), "delivery failed after 3 attempts");
    }

    #[test]
    fn core_errors_map_to_database() {
        let err: DeliveryError = CoreError::Database("pool timeout".to_string()).into();
        assert!(matches!(err, DeliveryError::Database { .. }));
    }
}
