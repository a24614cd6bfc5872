//! Core domain models and persistence for the webhook relay.
//!
//! Provides strongly-typed domain primitives, the error taxonomy, a clock
//! abstraction for deterministic tests, and PostgreSQL repositories for
//! deliveries, the dead letter queue, webhook configuration, and metrics.
//! The delivery pipeline crate builds on these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    BlockchainEvent, DeadLetterEntry, DeadLetterFilter, DeadLetterStats, Delivery, DeliveryId,
    DeliveryStatus, Metric, MetricKind, QueueCounts, SubscriptionId, WebhookConfig, WebhookFormat,
    WebhookId,
};
pub use sqlx::types::Json;
pub use time::{Clock, SystemClock, TestClock};
