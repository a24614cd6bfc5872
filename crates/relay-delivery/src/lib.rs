//! Reliable webhook delivery pipeline for blockchain event notifications.
//!
//! This crate implements the delivery subsystem of the webhook relay:
//! deliveries are persisted in PostgreSQL, claimed under a per-process
//! concurrency cap, dispatched to an external sender, and retried with
//! exponential backoff and jitter until they complete or exhaust their
//! budget and land in the dead letter archive.
//!
//! # Architecture
//!
//! A [`DeliveryQueue`] runs two independent background loops:
//!
//! 1. **Dispatch loop**: claims due deliveries (atomic claim in the
//!    database, `FOR UPDATE SKIP LOCKED`) up to the concurrency cap and
//!    fires each one at the handler without waiting for it to finish.
//! 2. **Maintenance loop**: prunes old completed rows and returns
//!    deliveries orphaned by a crashed worker to the claim pool. This
//!    reset is the sole crash-recovery mechanism.
//!
//! The [`QueueProcessor`] is the orchestration layer: it resolves webhook
//! configuration (through a TTL [`WebhookConfigCache`]), invokes the
//! external [`WebhookSender`] collaborator, and feeds results back to the
//! queue. The [`RetrySchedule`] policy is swappable at runtime.
//!
//! # Delivery semantics
//!
//! At-least-once with idempotent retries; endpoint-side deduplication is
//! the consumer's responsibility. The concurrency cap is per-process:
//! horizontally scaled deployments see effective concurrency grow with
//! process count, bounded only by the database claim for correctness.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod store;

pub use cache::{CacheStats, WebhookConfigCache};
pub use error::{DeliveryError, Result};
pub use metrics::MetricsCollector;
pub use processor::QueueProcessor;
pub use queue::{DeliveryHandler, DeliveryQueue, QueueConfig, QueueStats};
pub use retry::{ExponentialBackoff, RetrySchedule};
pub use sender::{SendReceipt, WebhookSender};

/// Default per-process concurrency cap for in-flight deliveries.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Default retry budget for deliveries without endpoint configuration.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
