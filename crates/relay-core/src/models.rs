//! Domain models and strongly-typed identifiers.
//!
//! Defines deliveries, blockchain event snapshots, webhook configuration,
//! dead letter entries, and metric records, plus newtype ID wrappers for
//! compile-time type safety. Includes database codec impls and the
//! defensive parsing applied at the persistence boundary.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::warn;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed delivery identifier.
    ///
    /// Follows a delivery from enqueue through its terminal state and keys
    /// the dead letter entry if retries are exhausted.
    DeliveryId
}

uuid_id! {
    /// Strongly-typed subscription identifier.
    ///
    /// References the event subscription that produced a delivery. Owned by
    /// the external event listener; the queue carries it verbatim.
    SubscriptionId
}

uuid_id! {
    /// Strongly-typed webhook endpoint identifier.
    WebhookId
}

/// Lifecycle state of a delivery.
///
/// `Completed` and `Failed` are terminal: no further writes occur except
/// dead-letter archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting to be claimed (initial state, also after a retry reschedule).
    Pending,
    /// Claimed by a worker, handler in flight.
    Processing,
    /// Delivered successfully. Terminal.
    Completed,
    /// Retries exhausted or non-retryable. Terminal.
    Failed,
}

impl DeliveryStatus {
    /// Returns true for terminal states.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        raw.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Immutable snapshot of a blockchain event, captured at enqueue time.
///
/// The queue persists this verbatim and performs no semantic validation.
/// Argument order is preserved via the ordered map so payload formatting
/// downstream is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainEvent {
    /// Address of the contract that emitted the event.
    pub contract_address: String,
    /// Event name as declared in the contract ABI.
    pub event_name: String,
    /// Block number the event was observed in.
    pub block_number: u64,
    /// Transaction hash containing the event log.
    pub transaction_hash: String,
    /// Index of the log within the transaction.
    pub log_index: u32,
    /// Decoded event arguments, in declaration order.
    pub args: BTreeMap<String, String>,
    /// When the event was observed by the listener.
    pub timestamp: DateTime<Utc>,
}

/// One attempt-tracked unit of work: send this event's payload to this
/// webhook.
///
/// Lifecycle: created by enqueue (`Pending`, attempts = 0), claimed
/// (`Processing`), then either `Completed`, rescheduled back to `Pending`
/// with an incremented attempt count and a future `next_retry`, or
/// `Failed` once `attempts == max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,

    /// Subscription that produced the event.
    pub subscription_id: SubscriptionId,

    /// Webhook endpoint the payload is destined for.
    pub webhook_id: WebhookId,

    /// Event snapshot, never mutated after enqueue.
    #[sqlx(rename = "event_data")]
    pub event: Json<BlockchainEvent>,

    /// Pre-formatted outbound body. Opaque to the queue.
    pub payload: Json<serde_json::Value>,

    /// Current lifecycle state.
    pub status: DeliveryStatus,

    /// Attempts consumed so far. Invariant: `attempts <= max_attempts`.
    pub attempts: i32,

    /// Retry budget, fixed at creation.
    pub max_attempts: i32,

    /// Earliest time the next attempt may be claimed. None means
    /// immediately eligible.
    pub next_retry: Option<DateTime<Utc>>,

    /// When a worker last claimed this delivery. Drives stuck detection.
    pub last_attempt: Option<DateTime<Utc>>,

    /// HTTP status of the last attempt, informational only.
    pub response_status: Option<i32>,

    /// Round-trip time of the last attempt in milliseconds.
    pub response_time: Option<i32>,

    /// Message from the last failure, if any.
    pub error_message: Option<String>,

    /// When the delivery was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the delivery reached `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Creates a new delivery ready for enqueue.
    pub fn new(
        subscription_id: SubscriptionId,
        webhook_id: WebhookId,
        event: BlockchainEvent,
        payload: serde_json::Value,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            webhook_id,
            event: Json(event),
            payload: Json(payload),
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry: None,
            last_attempt: None,
            response_status: None,
            response_time: None,
            error_message: None,
            created_at: now,
            completed_at: None,
        }
    }
}

/// Outbound payload format for a webhook endpoint.
///
/// Unrecognized values normalize to [`WebhookFormat::Generic`] so a bad
/// row in the configuration table can never break delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    /// Plain JSON POST, the default.
    Generic,
    /// Slack incoming-webhook payload shape.
    Slack,
    /// Discord webhook payload shape.
    Discord,
    /// Telegram bot API payload shape.
    Telegram,
}

impl WebhookFormat {
    /// Parses a stored format value, defaulting unknown values to Generic.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "generic" => Self::Generic,
            "slack" => Self::Slack,
            "discord" => Self::Discord,
            "telegram" => Self::Telegram,
            other => {
                warn!(format = other, "unrecognized webhook format, using generic");
                Self::Generic
            },
        }
    }
}

impl fmt::Display for WebhookFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generic => "generic",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Telegram => "telegram",
        };
        write!(f, "{s}")
    }
}

/// Read-mostly webhook endpoint configuration.
///
/// Owned by the external configuration store; the delivery subsystem only
/// reads and caches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint identifier.
    pub id: WebhookId,
    /// Destination URL.
    pub url: String,
    /// Payload format for the external sender.
    pub format: WebhookFormat,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_seconds: i32,
    /// Retry budget applied to deliveries for this endpoint.
    pub retry_attempts: i32,
}

/// Parses a stored headers JSON value, defaulting to an empty map.
///
/// Malformed JSON is a warning, never an error: a corrupt headers column
/// must not take the endpoint out of rotation.
pub fn parse_header_map(raw: &serde_json::Value) -> BTreeMap<String, String> {
    match serde_json::from_value::<BTreeMap<String, String>>(raw.clone()) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "malformed webhook headers JSON, using empty map");
            BTreeMap::new()
        },
    }
}

/// Terminal archival record for a delivery that exhausted its retries.
///
/// Keyed by the originating delivery id and never mutated after creation.
/// Lives in its own table so the live queue can be pruned aggressively
/// without losing forensic history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    /// Originating delivery id.
    pub id: DeliveryId,
    /// Subscription that produced the event.
    pub subscription_id: SubscriptionId,
    /// Destination webhook.
    pub webhook_id: WebhookId,
    /// Event snapshot carried over from the delivery.
    #[sqlx(rename = "event_data")]
    pub event: Json<BlockchainEvent>,
    /// Outbound body carried over from the delivery.
    pub payload: Json<serde_json::Value>,
    /// Why the delivery was archived (e.g. "retries exhausted").
    pub failure_reason: String,
    /// When the delivery permanently failed.
    pub failed_at: DateTime<Utc>,
    /// Attempts consumed before giving up.
    pub attempts: i32,
    /// Message from the final failed attempt.
    pub last_error: Option<String>,
}

/// Filter for querying dead letter entries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Restrict to one webhook endpoint.
    pub webhook_id: Option<WebhookId>,
    /// Restrict to one subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Maximum rows to return (default 100).
    pub limit: Option<i64>,
}

/// Operational statistics over the dead letter queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadLetterStats {
    /// Total archived entries.
    pub total: i64,
    /// Entries archived in the last 24 hours.
    pub last_24h: i64,
    /// Entries archived in the last 7 days.
    pub last_7d: i64,
    /// Failure reasons grouped by frequency, most common first.
    pub top_reasons: Vec<(String, i64)>,
}

/// Delivery counts grouped by status. Missing statuses default to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Deliveries waiting to be claimed.
    pub pending: i64,
    /// Deliveries claimed by a worker.
    pub processing: i64,
    /// Successfully delivered.
    pub completed: i64,
    /// Permanently failed.
    pub failed: i64,
}

/// Kind of an aggregated metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing count, accumulates across flushes.
    Counter,
    /// Last-write-wins snapshot, cleared after each flush.
    Gauge,
    /// Windowed distribution, cleared after each flush.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        };
        write!(f, "{s}")
    }
}

/// One aggregated metric sample, ready for durable flush.
///
/// Identity is name plus the sorted label set; the ordered map makes
/// label order irrelevant at the type level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name, e.g. `deliveries_completed`.
    pub name: String,
    /// Counter, gauge, or histogram.
    pub kind: MetricKind,
    /// Exported value. For histograms this is the p95 of the retained
    /// window, not of all-time data.
    pub value: f64,
    /// Dimension labels.
    pub labels: BTreeMap<String, String>,
    /// When the sample was captured.
    pub timestamp: DateTime<Utc>,
}
