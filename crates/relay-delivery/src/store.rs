//! Storage seam between the delivery pipeline and PostgreSQL.
//!
//! Trait-based abstractions over the persistence operations the queue,
//! dead letter archive, config cache, and metrics collector need.
//! Production implementations wrap `relay_core::storage::Storage`; tests
//! use the in-memory implementations in [`mock`] for deterministic
//! behavior without a database.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use relay_core::{
    error::Result, DeadLetterEntry, DeadLetterFilter, DeadLetterStats, Delivery, DeliveryId,
    DeliveryStatus, Metric, QueueCounts, WebhookConfig, WebhookId,
};

/// Boxed future alias used by the seam traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence operations required by the delivery queue.
///
/// Owns every state transition that must survive a crash. Foreground
/// callers see errors directly; the queue's background loops catch and
/// log them.
pub trait DeliveryStore: Send + Sync + 'static {
    /// Persists a delivery in its initial pending state.
    ///
    /// Implementations must force `status = pending`, `attempts = 0`, and
    /// a null retry timestamp regardless of the struct's contents.
    fn save(&self, delivery: Delivery) -> BoxFuture<'_, Result<DeliveryId>>;

    /// Atomically claims the oldest due delivery and flips it to
    /// processing. The select-and-flip is a single atomic unit so two
    /// concurrent callers never claim the same row.
    fn claim_next(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Option<Delivery>>>;

    /// Updates a delivery's status, stamping `completed_at` on completion
    /// and recording the error message when provided.
    fn update_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Returns a delivery to pending with an absolute attempt count and a
    /// future retry time.
    fn update_retry_schedule(
        &self,
        id: DeliveryId,
        next_retry: DateTime<Utc>,
        attempts: i32,
    ) -> BoxFuture<'_, Result<()>>;

    /// Records response status and timing from the latest attempt.
    fn record_response(
        &self,
        id: DeliveryId,
        response_status: Option<i32>,
        response_time_ms: Option<i32>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Delivery counts grouped by status, missing statuses zeroed.
    fn counts(&self) -> BoxFuture<'_, Result<QueueCounts>>;

    /// Deletes completed deliveries older than the cutoff, returning the
    /// count removed.
    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    /// Returns orphaned processing deliveries to the claim pool, returning
    /// the count reset.
    fn reset_stuck(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> BoxFuture<'_, Result<u64>>;
}

/// Persistence operations for the dead letter archive.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Archives a permanently failed delivery, keyed by its delivery id.
    fn add(&self, entry: DeadLetterEntry) -> BoxFuture<'_, Result<()>>;

    /// Finds archived entries matching the filter.
    fn find(&self, filter: DeadLetterFilter) -> BoxFuture<'_, Result<Vec<DeadLetterEntry>>>;

    /// Removes one archived entry, returning whether it existed.
    fn remove(&self, id: DeliveryId) -> BoxFuture<'_, Result<bool>>;

    /// Deletes entries archived before the cutoff, returning the count.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    /// Aggregates archive statistics (totals, recent windows, top failure
    /// reasons).
    fn stats(&self, now: DateTime<Utc>, top_n: i64) -> BoxFuture<'_, Result<DeadLetterStats>>;
}

/// Read access to the external webhook configuration store.
pub trait ConfigStore: Send + Sync + 'static {
    /// Finds one active webhook config.
    fn find_active(&self, id: WebhookId) -> BoxFuture<'_, Result<Option<WebhookConfig>>>;

    /// Returns all active webhook configs.
    fn find_all_active(&self) -> BoxFuture<'_, Result<Vec<WebhookConfig>>>;
}

/// Durable sink for flushed metric samples.
pub trait MetricsStore: Send + Sync + 'static {
    /// Writes a batch of samples atomically.
    fn write_all(&self, metrics: Vec<Metric>) -> BoxFuture<'_, Result<()>>;
}

/// Production [`DeliveryStore`] backed by PostgreSQL.
pub struct PostgresDeliveryStore {
    storage: Arc<relay_core::storage::Storage>,
}

impl PostgresDeliveryStore {
    /// Creates a new PostgreSQL delivery store adapter.
    pub fn new(storage: Arc<relay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStore for PostgresDeliveryStore {
    fn save(&self, delivery: Delivery) -> BoxFuture<'_, Result<DeliveryId>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.create(&delivery).await })
    }

    fn claim_next(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Option<Delivery>>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.claim_next(now).await })
    }

    fn update_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.update_status(id, status, error.as_deref()).await })
    }

    fn update_retry_schedule(
        &self,
        id: DeliveryId,
        next_retry: DateTime<Utc>,
        attempts: i32,
    ) -> BoxFuture<'_, Result<()>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.update_retry_schedule(id, next_retry, attempts).await })
    }

    fn record_response(
        &self,
        id: DeliveryId,
        response_status: Option<i32>,
        response_time_ms: Option<i32>,
    ) -> BoxFuture<'_, Result<()>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.deliveries.record_response(id, response_status, response_time_ms).await
        })
    }

    fn counts(&self) -> BoxFuture<'_, Result<QueueCounts>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.counts_by_status().await })
    }

    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.delete_completed_before(cutoff).await })
    }

    fn reset_stuck(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> BoxFuture<'_, Result<u64>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.reset_stuck(now, threshold).await })
    }
}

/// Production [`DeadLetterStore`] backed by PostgreSQL.
pub struct PostgresDeadLetterStore {
    storage: Arc<relay_core::storage::Storage>,
}

impl PostgresDeadLetterStore {
    /// Creates a new PostgreSQL dead letter store adapter.
    pub fn new(storage: Arc<relay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn add(&self, entry: DeadLetterEntry) -> BoxFuture<'_, Result<()>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.create(&entry).await })
    }

    fn find(&self, filter: DeadLetterFilter) -> BoxFuture<'_, Result<Vec<DeadLetterEntry>>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.find(&filter).await })
    }

    fn remove(&self, id: DeliveryId) -> BoxFuture<'_, Result<bool>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.delete(id).await })
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.delete_older_than(cutoff).await })
    }

    fn stats(&self, now: DateTime<Utc>, top_n: i64) -> BoxFuture<'_, Result<DeadLetterStats>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.stats(now, top_n).await })
    }
}

/// Production [`ConfigStore`] backed by PostgreSQL.
pub struct PostgresConfigStore {
    storage: Arc<relay_core::storage::Storage>,
}

impl PostgresConfigStore {
    /// Creates a new PostgreSQL config store adapter.
    pub fn new(storage: Arc<relay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl ConfigStore for PostgresConfigStore {
    fn find_active(&self, id: WebhookId) -> BoxFuture<'_, Result<Option<WebhookConfig>>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.find_active(id).await })
    }

    fn find_all_active(&self) -> BoxFuture<'_, Result<Vec<WebhookConfig>>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.find_all_active().await })
    }
}

/// Production [`MetricsStore`] backed by PostgreSQL.
pub struct PostgresMetricsStore {
    storage: Arc<relay_core::storage::Storage>,
}

impl PostgresMetricsStore {
    /// Creates a new PostgreSQL metrics store adapter.
    pub fn new(storage: Arc<relay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl MetricsStore for PostgresMetricsStore {
    fn write_all(&self, metrics: Vec<Metric>) -> BoxFuture<'_, Result<()>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.metrics.insert_all(&metrics).await })
    }
}

pub mod mock {
    //! In-memory store implementations for testing.
    //!
    //! Deterministic, dependency-free doubles with failure injection so
    //! tests can exercise the archive-failure and refresh-failure paths.

    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU64, Ordering},
    };

    use chrono::Duration;
    use relay_core::CoreError;
    use tokio::sync::RwLock;

    use super::*;

    /// In-memory [`DeliveryStore`].
    #[derive(Default)]
    pub struct MockDeliveryStore {
        deliveries: RwLock<HashMap<DeliveryId, Delivery>>,
        fail_next: RwLock<Option<String>>,
    }

    impl MockDeliveryStore {
        /// Creates an empty mock store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next operation fail with a database error.
        pub async fn inject_error(&self, message: impl Into<String>) {
            *self.fail_next.write().await = Some(message.into());
        }

        /// Returns a stored delivery for verification.
        pub async fn get(&self, id: DeliveryId) -> Option<Delivery> {
            self.deliveries.read().await.get(&id).cloned()
        }

        /// Inserts a delivery verbatim, bypassing the save normalization.
        pub async fn insert_raw(&self, delivery: Delivery) {
            self.deliveries.write().await.insert(delivery.id, delivery);
        }

        async fn take_failure(&self) -> Result<()> {
            if let Some(message) = self.fail_next.write().await.take() {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }
    }

    impl DeliveryStore for MockDeliveryStore {
        fn save(&self, mut delivery: Delivery) -> BoxFuture<'_, Result<DeliveryId>> {
            Box::pin(async move {
                self.take_failure().await?;
                delivery.status = DeliveryStatus::Pending;
                delivery.attempts = 0;
                delivery.next_retry = None;
                let id = delivery.id;
                self.deliveries.write().await.insert(id, delivery);
                Ok(id)
            })
        }

        fn claim_next(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Option<Delivery>>> {
            Box::pin(async move {
                self.take_failure().await?;
                let mut deliveries = self.deliveries.write().await;
                let due = deliveries
                    .values()
                    .filter(|d| {
                        d.status == DeliveryStatus::Pending
                            && d.next_retry.is_none_or(|t| t <= now)
                    })
                    .min_by_key(|d| d.created_at)
                    .map(|d| d.id);

                let Some(id) = due else { return Ok(None) };
                let delivery = deliveries.get_mut(&id).ok_or_else(|| {
                    CoreError::NotFound(format!("delivery {id} vanished during claim"))
                })?;
                delivery.status = DeliveryStatus::Processing;
                delivery.last_attempt = Some(now);
                Ok(Some(delivery.clone()))
            })
        }

        fn update_status(
            &self,
            id: DeliveryId,
            status: DeliveryStatus,
            error: Option<String>,
        ) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.take_failure().await?;
                if let Some(delivery) = self.deliveries.write().await.get_mut(&id) {
                    delivery.status = status;
                    if status == DeliveryStatus::Completed {
                        delivery.completed_at = Some(Utc::now());
                    }
                    if error.is_some() {
                        delivery.error_message = error;
                    }
                }
                Ok(())
            })
        }

        fn update_retry_schedule(
            &self,
            id: DeliveryId,
            next_retry: DateTime<Utc>,
            attempts: i32,
        ) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.take_failure().await?;
                if let Some(delivery) = self.deliveries.write().await.get_mut(&id) {
                    delivery.status = DeliveryStatus::Pending;
                    delivery.next_retry = Some(next_retry);
                    delivery.attempts = attempts;
                }
                Ok(())
            })
        }

        fn record_response(
            &self,
            id: DeliveryId,
            response_status: Option<i32>,
            response_time_ms: Option<i32>,
        ) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                if let Some(delivery) = self.deliveries.write().await.get_mut(&id) {
                    delivery.response_status = response_status;
                    delivery.response_time = response_time_ms;
                }
                Ok(())
            })
        }

        fn counts(&self) -> BoxFuture<'_, Result<QueueCounts>> {
            Box::pin(async move {
                self.take_failure().await?;
                let mut counts = QueueCounts::default();
                for delivery in self.deliveries.read().await.values() {
                    match delivery.status {
                        DeliveryStatus::Pending => counts.pending += 1,
                        DeliveryStatus::Processing => counts.processing += 1,
                        DeliveryStatus::Completed => counts.completed += 1,
                        DeliveryStatus::Failed => counts.failed += 1,
                    }
                }
                Ok(counts)
            })
        }

        fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async move {
                self.take_failure().await?;
                let mut deliveries = self.deliveries.write().await;
                let before = deliveries.len();
                deliveries.retain(|_, d| {
                    !(d.status == DeliveryStatus::Completed
                        && d.completed_at.is_some_and(|t| t < cutoff))
                });
                Ok((before - deliveries.len()) as u64)
            })
        }

        fn reset_stuck(
            &self,
            now: DateTime<Utc>,
            threshold: Duration,
        ) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async move {
                self.take_failure().await?;
                let cutoff = now - threshold;
                let mut reset = 0u64;
                for delivery in self.deliveries.write().await.values_mut() {
                    if delivery.status == DeliveryStatus::Processing
                        && delivery.last_attempt.is_some_and(|t| t < cutoff)
                    {
                        delivery.status = DeliveryStatus::Pending;
                        delivery.next_retry = None;
                        reset += 1;
                    }
                }
                Ok(reset)
            })
        }
    }

    /// In-memory [`DeadLetterStore`].
    #[derive(Default)]
    pub struct MockDeadLetterStore {
        entries: RwLock<HashMap<DeliveryId, DeadLetterEntry>>,
        fail_next: RwLock<Option<String>>,
    }

    impl MockDeadLetterStore {
        /// Creates an empty mock archive.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next operation fail with a database error.
        pub async fn inject_error(&self, message: impl Into<String>) {
            *self.fail_next.write().await = Some(message.into());
        }

        /// Returns an archived entry for verification.
        pub async fn get(&self, id: DeliveryId) -> Option<DeadLetterEntry> {
            self.entries.read().await.get(&id).cloned()
        }

        /// Number of archived entries.
        pub async fn len(&self) -> usize {
            self.entries.read().await.len()
        }

        /// Whether the archive is empty.
        pub async fn is_empty(&self) -> bool {
            self.entries.read().await.is_empty()
        }

        async fn take_failure(&self) -> Result<()> {
            if let Some(message) = self.fail_next.write().await.take() {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }
    }

    impl DeadLetterStore for MockDeadLetterStore {
        fn add(&self, entry: DeadLetterEntry) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.take_failure().await?;
                self.entries.write().await.insert(entry.id, entry);
                Ok(())
            })
        }

        fn find(&self, filter: DeadLetterFilter) -> BoxFuture<'_, Result<Vec<DeadLetterEntry>>> {
            Box::pin(async move {
                let entries = self.entries.read().await;
                let mut matched: Vec<DeadLetterEntry> = entries
                    .values()
                    .filter(|e| filter.webhook_id.is_none_or(|id| e.webhook_id == id))
                    .filter(|e| {
                        filter.subscription_id.is_none_or(|id| e.subscription_id == id)
                    })
                    .cloned()
                    .collect();
                matched.sort_by_key(|e| std::cmp::Reverse(e.failed_at));
                matched.truncate(usize::try_from(filter.limit.unwrap_or(100)).unwrap_or(100));
                Ok(matched)
            })
        }

        fn remove(&self, id: DeliveryId) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async move { Ok(self.entries.write().await.remove(&id).is_some()) })
        }

        fn delete_older_than(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
            Box::pin(async move {
                let mut entries = self.entries.write().await;
                let before = entries.len();
                entries.retain(|_, e| e.failed_at >= cutoff);
                Ok((before - entries.len()) as u64)
            })
        }

        fn stats(&self, now: DateTime<Utc>, top_n: i64) -> BoxFuture<'_, Result<DeadLetterStats>> {
            Box::pin(async move {
                let entries = self.entries.read().await;
                let mut reasons: HashMap<String, i64> = HashMap::new();
                let mut last_24h = 0;
                let mut last_7d = 0;
                for entry in entries.values() {
                    *reasons.entry(entry.failure_reason.clone()).or_default() += 1;
                    if entry.failed_at >= now - Duration::hours(24) {
                        last_24h += 1;
                    }
                    if entry.failed_at >= now - Duration::days(7) {
                        last_7d += 1;
                    }
                }
                let mut top_reasons: Vec<(String, i64)> = reasons.into_iter().collect();
                top_reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                top_reasons.truncate(usize::try_from(top_n).unwrap_or(10));

                Ok(DeadLetterStats {
                    total: entries.len() as i64,
                    last_24h,
                    last_7d,
                    top_reasons,
                })
            })
        }
    }

    /// In-memory [`ConfigStore`] that counts queries for TTL assertions.
    #[derive(Default)]
    pub struct MockConfigStore {
        configs: RwLock<HashMap<WebhookId, WebhookConfig>>,
        query_count: AtomicU64,
        failing: RwLock<bool>,
    }

    impl MockConfigStore {
        /// Creates an empty mock config store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an active webhook config.
        pub async fn put(&self, config: WebhookConfig) {
            self.configs.write().await.insert(config.id, config);
        }

        /// Removes a webhook config, as if deactivated.
        pub async fn delete(&self, id: WebhookId) {
            self.configs.write().await.remove(&id);
        }

        /// Number of store queries issued so far.
        pub fn query_count(&self) -> u64 {
            self.query_count.load(Ordering::Acquire)
        }

        /// Makes all subsequent queries fail until cleared.
        pub async fn set_failing(&self, failing: bool) {
            *self.failing.write().await = failing;
        }

        async fn check_failing(&self) -> Result<()> {
            if *self.failing.read().await {
                return Err(CoreError::Database("config store unavailable".to_string()));
            }
            Ok(())
        }
    }

    impl ConfigStore for MockConfigStore {
        fn find_active(&self, id: WebhookId) -> BoxFuture<'_, Result<Option<WebhookConfig>>> {
            Box::pin(async move {
                self.query_count.fetch_add(1, Ordering::AcqRel);
                self.check_failing().await?;
                Ok(self.configs.read().await.get(&id).cloned())
            })
        }

        fn find_all_active(&self) -> BoxFuture<'_, Result<Vec<WebhookConfig>>> {
            Box::pin(async move {
                self.query_count.fetch_add(1, Ordering::AcqRel);
                self.check_failing().await?;
                Ok(self.configs.read().await.values().cloned().collect())
            })
        }
    }

    /// In-memory [`MetricsStore`] that records flushed batches.
    #[derive(Default)]
    pub struct MockMetricsStore {
        batches: RwLock<Vec<Vec<Metric>>>,
        failing: RwLock<bool>,
    }

    impl MockMetricsStore {
        /// Creates an empty mock metrics sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// All flushed batches, oldest first.
        pub async fn batches(&self) -> Vec<Vec<Metric>> {
            self.batches.read().await.clone()
        }

        /// Makes all subsequent writes fail until cleared.
        pub async fn set_failing(&self, failing: bool) {
            *self.failing.write().await = failing;
        }
    }

    impl MetricsStore for MockMetricsStore {
        fn write_all(&self, metrics: Vec<Metric>) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                if *self.failing.read().await {
                    return Err(CoreError::Database("metrics store unavailable".to_string()));
                }
                self.batches.write().await.push(metrics);
                Ok(())
            })
        }
    }
}
