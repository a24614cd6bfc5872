//! Bounded concurrent delivery queue over the persistence store.
//!
//! In-process façade that owns the concurrency cap and the two background
//! loops: dispatch (claim due deliveries and fire them at the handler)
//! and maintenance (prune completed rows, reset stuck deliveries). All
//! durable state transitions delegate to the [`DeliveryStore`]; the only
//! in-memory state is the processing counter.
//!
//! The counter is process-local. Across processes the atomic database
//! claim is the sole safety mechanism, so the cap bounds concurrency per
//! process, not cluster-wide.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use relay_core::{
    Clock, DeadLetterEntry, Delivery, DeliveryId, DeliveryStatus, QueueCounts,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::{ExponentialBackoff, RetrySchedule},
    sender::SendReceipt,
    store::{BoxFuture, DeadLetterStore, DeliveryStore},
    DEFAULT_MAX_CONCURRENT,
};

/// Configuration for a delivery queue instance.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-process cap on in-flight deliveries.
    ///
    /// Horizontally scaled deployments multiply effective concurrency by
    /// process count; only the database claim bounds cross-process
    /// correctness.
    pub max_concurrent: usize,

    /// How often the dispatch loop polls for due deliveries.
    pub dispatch_interval: Duration,

    /// How often the maintenance loop runs cleanup and stuck recovery.
    pub maintenance_interval: Duration,

    /// Age past which completed deliveries are pruned.
    pub completed_retention: Duration,

    /// Staleness past which a processing delivery is presumed orphaned.
    pub stuck_threshold: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            dispatch_interval: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(3600),
            completed_retention: Duration::from_secs(24 * 3600),
            stuck_threshold: Duration::from_secs(300),
        }
    }
}

/// Handler invoked for each claimed delivery.
///
/// Resolving with a receipt marks the delivery complete; an error counts
/// as a failed attempt and is routed through the retry policy.
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Processes one claimed delivery.
    fn handle(&self, delivery: Delivery) -> BoxFuture<'_, Result<SendReceipt>>;
}

/// Live and persisted queue statistics.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// In-flight deliveries in this process.
    pub processing_count: usize,
    /// Configured per-process cap.
    pub max_concurrent: usize,
    /// Persisted counts grouped by status.
    pub counts: QueueCounts,
}

struct LoopHandles {
    token: CancellationToken,
    dispatch: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

/// Bounded concurrent queue over durable delivery state.
pub struct DeliveryQueue {
    store: Arc<dyn DeliveryStore>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    retry: tokio::sync::RwLock<Arc<dyn RetrySchedule>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    processing_count: AtomicUsize,
    loops: Mutex<Option<LoopHandles>>,
}

impl DeliveryQueue {
    /// Creates a queue over the given store with the default retry policy.
    pub fn new(store: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            dead_letters: None,
            retry: tokio::sync::RwLock::new(Arc::new(ExponentialBackoff::default())),
            clock,
            config,
            processing_count: AtomicUsize::new(0),
            loops: Mutex::new(None),
        }
    }

    /// Attaches a dead letter archive for terminally failed deliveries.
    #[must_use]
    pub fn with_dead_letter_store(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Replaces the retry policy at construction time.
    #[must_use]
    pub fn with_retry_schedule(mut self, schedule: Arc<dyn RetrySchedule>) -> Self {
        self.retry = tokio::sync::RwLock::new(schedule);
        self
    }

    /// Current retry policy.
    pub async fn retry_schedule(&self) -> Arc<dyn RetrySchedule> {
        self.retry.read().await.clone()
    }

    /// Swaps the retry policy on a live queue.
    pub async fn set_retry_schedule(&self, schedule: Arc<dyn RetrySchedule>) {
        *self.retry.write().await = schedule;
    }

    /// Persists a new delivery in its initial state.
    ///
    /// Any pre-set status, attempt count, or retry timestamp on the value
    /// is discarded: enqueued work always starts pending with a zeroed
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails.
    pub async fn enqueue(&self, mut delivery: Delivery) -> Result<DeliveryId> {
        delivery.status = DeliveryStatus::Pending;
        delivery.attempts = 0;
        delivery.next_retry = None;

        let id = self.store.save(delivery).await?;
        debug!(delivery_id = %id, "delivery enqueued");
        Ok(id)
    }

    /// Claims the next due delivery, respecting the concurrency cap.
    ///
    /// Returns `None` without touching persistence when the cap is
    /// reached (backpressure). Every `Some` return has incremented the
    /// processing count by exactly one.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn dequeue(&self) -> Result<Option<Delivery>> {
        if !self.try_reserve_slot() {
            return Ok(None);
        }

        match self.store.claim_next(self.clock.now_utc()).await {
            Ok(Some(delivery)) => Ok(Some(delivery)),
            Ok(None) => {
                self.release_slot();
                Ok(None)
            },
            Err(error) => {
                self.release_slot();
                Err(error.into())
            },
        }
    }

    /// Marks a delivery complete and releases its slot.
    ///
    /// # Errors
    ///
    /// Returns error if the status update fails. The slot is released
    /// either way.
    pub async fn mark_complete(&self, id: DeliveryId) -> Result<()> {
        let result = self.store.update_status(id, DeliveryStatus::Completed, None).await;
        self.release_slot();
        result.map_err(Into::into)
    }

    /// Marks a delivery terminally failed and releases its slot.
    ///
    /// # Errors
    ///
    /// Returns error if the status update fails. The slot is released
    /// either way.
    pub async fn mark_failed(&self, id: DeliveryId, error: &str) -> Result<()> {
        let result = self
            .store
            .update_status(id, DeliveryStatus::Failed, Some(error.to_string()))
            .await;
        self.release_slot();
        result.map_err(Into::into)
    }

    /// Reschedules a delivery for retry and releases its slot.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails. The slot is released either way.
    pub async fn schedule_retry(
        &self,
        id: DeliveryId,
        next_retry: chrono::DateTime<chrono::Utc>,
        attempts: i32,
    ) -> Result<()> {
        let result = self.store.update_retry_schedule(id, next_retry, attempts).await;
        self.release_slot();
        result.map_err(Into::into)
    }

    /// Runs one claimed delivery through the handler and routes the result.
    ///
    /// Success marks the delivery complete. Failure consults the retry
    /// policy: with budget left the delivery is rescheduled with an
    /// incremented attempt count; otherwise it is terminally failed and,
    /// when an archive is attached, dead-lettered best-effort. An archive
    /// failure is logged, never propagated: the terminal status in the
    /// main store is the source of truth.
    ///
    /// # Errors
    ///
    /// Returns error if a foreground persistence write fails.
    pub async fn process_delivery(
        &self,
        delivery: Delivery,
        handler: &dyn DeliveryHandler,
    ) -> Result<()> {
        let id = delivery.id;

        match handler.handle(delivery.clone()).await {
            Ok(receipt) => {
                if let Err(error) = self
                    .store
                    .record_response(id, receipt.response_status, receipt.response_time_ms)
                    .await
                {
                    warn!(delivery_id = %id, error = %error, "failed to record response details");
                }
                self.mark_complete(id).await?;
                info!(delivery_id = %id, status = ?receipt.response_status, "delivery completed");
            },
            Err(failure) => {
                let schedule = self.retry.read().await.clone();
                if schedule.should_retry(&delivery) {
                    let attempts = delivery.attempts + 1;
                    let next =
                        schedule.next_retry_at(attempts.unsigned_abs(), self.clock.now_utc());
                    self.schedule_retry(id, next, attempts).await?;
                    warn!(
                        delivery_id = %id,
                        attempts,
                        next_retry = %next,
                        error = %failure,
                        "delivery failed, retry scheduled"
                    );
                } else {
                    self.mark_failed(id, &failure.to_string()).await?;
                    error!(
                        delivery_id = %id,
                        attempts = delivery.attempts,
                        error = %failure,
                        "delivery permanently failed"
                    );
                    self.archive_failed(&delivery, &failure).await;
                }
            },
        }

        Ok(())
    }

    /// Best-effort dead-letter archival of a terminally failed delivery.
    async fn archive_failed(&self, delivery: &Delivery, failure: &DeliveryError) {
        let Some(dead_letters) = &self.dead_letters else { return };

        let reason = if delivery.attempts >= delivery.max_attempts {
            "retries exhausted".to_string()
        } else {
            "non-retryable failure".to_string()
        };
        let entry = DeadLetterEntry {
            id: delivery.id,
            subscription_id: delivery.subscription_id,
            webhook_id: delivery.webhook_id,
            event: delivery.event.clone(),
            payload: delivery.payload.clone(),
            failure_reason: reason,
            failed_at: self.clock.now_utc(),
            attempts: delivery.attempts,
            last_error: Some(failure.to_string()),
        };

        if let Err(error) = dead_letters.add(entry).await {
            warn!(
                delivery_id = %delivery.id,
                error = %error,
                "failed to archive delivery to dead letter queue"
            );
        }
    }

    /// Starts the dispatch and maintenance loops.
    ///
    /// A second call while the loops are running is a no-op.
    pub fn start_processing(self: &Arc<Self>, handler: Arc<dyn DeliveryHandler>) {
        let mut loops = self.loops.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if loops.is_some() {
            debug!("queue processing already started");
            return;
        }

        let token = CancellationToken::new();
        let dispatch = tokio::spawn(run_dispatch_loop(
            Arc::clone(self),
            handler,
            token.clone(),
        ));
        let maintenance = tokio::spawn(run_maintenance_loop(Arc::clone(self), token.clone()));

        *loops = Some(LoopHandles { token, dispatch, maintenance });
        info!(
            max_concurrent = self.config.max_concurrent,
            dispatch_interval_ms = self.config.dispatch_interval.as_millis() as u64,
            "delivery queue processing started"
        );
    }

    /// Stops both loops.
    ///
    /// Idempotent. In-flight handler invocations already dispatched run
    /// to completion and still update persisted state and the processing
    /// count afterward.
    pub async fn stop_processing(&self) {
        let handles = self
            .loops
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        let Some(handles) = handles else { return };
        handles.token.cancel();
        let _ = handles.dispatch.await;
        let _ = handles.maintenance.await;
        info!("delivery queue processing stopped");
    }

    /// Merges live and persisted queue statistics.
    ///
    /// # Errors
    ///
    /// Returns error if the persisted counts query fails.
    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self.store.counts().await?;
        Ok(QueueStats {
            processing_count: self.processing_count(),
            max_concurrent: self.config.max_concurrent,
            counts,
        })
    }

    /// Number of pending deliveries in the store.
    ///
    /// # Errors
    ///
    /// Returns error if the counts query fails.
    pub async fn queue_size(&self) -> Result<i64> {
        Ok(self.store.counts().await?.pending)
    }

    /// In-flight deliveries in this process.
    pub fn processing_count(&self) -> usize {
        self.processing_count.load(Ordering::Acquire)
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn try_reserve_slot(&self) -> bool {
        self.processing_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.config.max_concurrent).then_some(count + 1)
            })
            .is_ok()
    }

    /// Decrements the processing count, floored at zero.
    ///
    /// Tolerates release after the slot was already freed, e.g. when the
    /// maintenance reset returned a stuck delivery to the pool while its
    /// original worker was still finishing.
    fn release_slot(&self) {
        let _ = self
            .processing_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }
}

/// Dispatch loop: drains due deliveries each tick and fires them at the
/// handler without awaiting completion.
async fn run_dispatch_loop(
    queue: Arc<DeliveryQueue>,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
) {
    loop {
        dispatch_tick(&queue, &handler).await;

        tokio::select! {
            () = queue.clock.sleep(queue.config.dispatch_interval) => {},
            () = token.cancelled() => break,
        }
    }
    debug!("dispatch loop stopped");
}

/// Claims deliveries until the store is drained or the cap is hit.
///
/// Per-delivery failures are caught in the spawned task so one bad
/// delivery cannot stall dispatch of the next.
async fn dispatch_tick(queue: &Arc<DeliveryQueue>, handler: &Arc<dyn DeliveryHandler>) {
    loop {
        match queue.dequeue().await {
            Ok(Some(delivery)) => {
                let queue = Arc::clone(queue);
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    let id = delivery.id;
                    if let Err(error) = queue.process_delivery(delivery, handler.as_ref()).await {
                        error!(delivery_id = %id, error = %error, "delivery processing failed");
                    }
                });
            },
            Ok(None) => break,
            Err(error) => {
                error!(error = %error, "failed to claim next delivery");
                break;
            },
        }
    }
}

/// Maintenance loop: retention cleanup plus stuck-delivery recovery.
///
/// Errors are logged and never escape; the loop continues on its next
/// tick.
async fn run_maintenance_loop(queue: Arc<DeliveryQueue>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = queue.clock.sleep(queue.config.maintenance_interval) => {},
            () = token.cancelled() => break,
        }

        maintenance_tick(&queue).await;
    }
    debug!("maintenance loop stopped");
}

async fn maintenance_tick(queue: &DeliveryQueue) {
    let now = queue.clock.now_utc();

    let retention = chrono::Duration::from_std(queue.config.completed_retention)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    match queue.store.delete_completed_before(now - retention).await {
        Ok(0) => {},
        Ok(deleted) => info!(deleted, "pruned completed deliveries"),
        Err(error) => error!(error = %error, "completed delivery cleanup failed"),
    }

    let threshold = chrono::Duration::from_std(queue.config.stuck_threshold)
        .unwrap_or_else(|_| chrono::Duration::minutes(5));
    match queue.store.reset_stuck(now, threshold).await {
        Ok(0) => {},
        Ok(reset) => warn!(reset, "returned stuck deliveries to the claim pool"),
        Err(error) => error!(error = %error, "stuck delivery reset failed"),
    }
}
