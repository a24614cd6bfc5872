//! PostgreSQL repositories for the webhook relay.
//!
//! One repository per table, aggregated behind [`Storage`]. All mutation of
//! persisted delivery state goes through these transactional primitives;
//! the delivery crate layers its in-process bookkeeping on top.
//!
//! Logical schema:
//!
//! - `deliveries(id, subscription_id, webhook_id, event_data, payload,
//!   status, attempts, max_attempts, next_retry, last_attempt,
//!   response_status, response_time, error_message, created_at,
//!   completed_at)`
//! - `dead_letter_queue(id, subscription_id, webhook_id, event_data,
//!   payload, failure_reason, failed_at, attempts, last_error)`
//! - `webhooks(id, url, format, headers, timeout_seconds, retry_attempts,
//!   active)`
//! - `metrics(id, metric_name, metric_type, metric_value, labels,
//!   timestamp)`

use std::sync::Arc;

use sqlx::PgPool;

pub mod dead_letters;
pub mod deliveries;
pub mod metrics;
pub mod webhooks;

/// Aggregated access to all repositories, sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Live delivery queue table.
    pub deliveries: deliveries::Repository,
    /// Dead letter archive.
    pub dead_letters: dead_letters::Repository,
    /// Webhook configuration table (read-only from this subsystem).
    pub webhooks: webhooks::Repository,
    /// Durable metric samples.
    pub metrics: metrics::Repository,
}

impl Storage {
    /// Creates repositories over a shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            deliveries: deliveries::Repository::new(pool.clone()),
            dead_letters: dead_letters::Repository::new(pool.clone()),
            webhooks: webhooks::Repository::new(pool.clone()),
            metrics: metrics::Repository::new(pool),
        }
    }
}
