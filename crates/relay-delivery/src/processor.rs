//! Orchestration layer tying the queue, config cache, sender, and
//! metrics together.
//!
//! The [`QueueProcessor`] is the handler the dispatch loop invokes for
//! each claimed delivery: it resolves the endpoint's webhook config and
//! delegates the actual HTTP work to the external [`WebhookSender`]. It
//! also fronts the operational surface consumed by health and metrics
//! endpoints.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use relay_core::{
    BlockchainEvent, Clock, DeadLetterEntry, DeadLetterFilter, DeadLetterStats, Delivery,
    DeliveryId, SubscriptionId, WebhookConfig, WebhookId,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    cache::WebhookConfigCache,
    error::{DeliveryError, Result},
    metrics::MetricsCollector,
    queue::{DeliveryHandler, DeliveryQueue, QueueStats},
    retry::RetrySchedule,
    sender::{SendReceipt, WebhookSender},
    store::{BoxFuture, DeadLetterStore},
    DEFAULT_MAX_ATTEMPTS,
};

/// Delivery pipeline orchestrator.
///
/// Holds the webhook config map the handler resolves against, populated
/// from the TTL cache and refreshable at runtime. Everything else is
/// delegation: claiming and state transitions to the [`DeliveryQueue`],
/// the HTTP call to the sender, archival queries to the dead letter
/// store.
pub struct QueueProcessor {
    queue: Arc<DeliveryQueue>,
    cache: Arc<WebhookConfigCache>,
    sender: Arc<dyn WebhookSender>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    metrics: Option<Arc<MetricsCollector>>,
    clock: Arc<dyn Clock>,
    configs: RwLock<HashMap<WebhookId, WebhookConfig>>,
}

impl QueueProcessor {
    /// Creates a processor over the given queue, cache, and sender.
    pub fn new(
        queue: Arc<DeliveryQueue>,
        cache: Arc<WebhookConfigCache>,
        sender: Arc<dyn WebhookSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            cache,
            sender,
            dead_letters: None,
            metrics: None,
            clock,
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Attaches the dead letter archive for the stats proxy.
    #[must_use]
    pub fn with_dead_letter_store(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Attaches a metrics collector for per-attempt instrumentation.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers a webhook config directly, bypassing the cache.
    ///
    /// Used by tests and by config-reload events pushed from the
    /// configuration owner.
    pub async fn set_webhook_config(&self, config: WebhookConfig) {
        self.configs.write().await.insert(config.id, config);
    }

    /// Drops a webhook config from the resolution map.
    pub async fn remove_webhook_config(&self, id: WebhookId) {
        self.configs.write().await.remove(&id);
    }

    /// Warms the config map from all active configs via the cache.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration store is unavailable.
    pub async fn load_configs(&self) -> Result<usize> {
        let loaded = self.cache.load_all().await?;
        let mut configs = self.configs.write().await;
        configs.clear();
        for config in loaded {
            configs.insert(config.id, config);
        }
        info!(configs = configs.len(), "webhook configs loaded");
        Ok(configs.len())
    }

    /// Resolves a webhook config: registered map first, then the TTL
    /// cache (which reads through to the store).
    async fn resolve_config(&self, id: WebhookId) -> Result<Option<WebhookConfig>> {
        if let Some(config) = self.configs.read().await.get(&id) {
            return Ok(Some(config.clone()));
        }

        let Some(config) = self.cache.get(id).await? else {
            return Ok(None);
        };
        self.configs.write().await.insert(id, config.clone());
        Ok(Some(config))
    }

    /// Builds and persists a delivery for an observed event.
    ///
    /// The retry budget comes from the endpoint's configured
    /// `retry_attempts` when known, otherwise the crate default.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails.
    pub async fn enqueue(
        &self,
        subscription_id: SubscriptionId,
        webhook_id: WebhookId,
        event: BlockchainEvent,
        payload: serde_json::Value,
    ) -> Result<DeliveryId> {
        let max_attempts = self
            .resolve_config(webhook_id)
            .await
            .ok()
            .flatten()
            .map_or(DEFAULT_MAX_ATTEMPTS, |c| c.retry_attempts);

        let delivery = Delivery::new(
            subscription_id,
            webhook_id,
            event,
            payload,
            max_attempts,
            self.clock.now_utc(),
        );
        self.queue.enqueue(delivery).await
    }

    /// Starts the queue's background loops with this processor as the
    /// handler, plus the metrics flush loop when configured.
    pub fn start(self: &Arc<Self>) {
        if let Some(metrics) = &self.metrics {
            metrics.start();
        }
        let handler: Arc<dyn DeliveryHandler> = Arc::clone(self) as Arc<dyn DeliveryHandler>;
        self.queue.start_processing(handler);
    }

    /// Stops the queue loops and the metrics flush loop. Idempotent.
    pub async fn stop(&self) {
        self.queue.stop_processing().await;
        if let Some(metrics) = &self.metrics {
            metrics.stop().await;
        }
    }

    /// Current retry policy.
    pub async fn retry_schedule(&self) -> Arc<dyn RetrySchedule> {
        self.queue.retry_schedule().await
    }

    /// Swaps the retry policy without reconstructing the queue.
    pub async fn set_retry_schedule(&self, schedule: Arc<dyn RetrySchedule>) {
        self.queue.set_retry_schedule(schedule).await;
    }

    /// Live and persisted queue statistics.
    ///
    /// # Errors
    ///
    /// Returns error if the counts query fails.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Number of pending deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if the counts query fails.
    pub async fn queue_size(&self) -> Result<i64> {
        self.queue.queue_size().await
    }

    /// In-flight deliveries in this process.
    pub fn processing_count(&self) -> usize {
        self.queue.processing_count()
    }

    /// Dead letter archive statistics for operator dashboards.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no archive is attached, or the
    /// store error if the query fails.
    pub async fn dead_letter_stats(&self, top_n: i64) -> Result<DeadLetterStats> {
        let store = self.dead_letter_store()?;
        Ok(store.stats(self.clock.now_utc(), top_n).await?)
    }

    /// Queries archived failed deliveries.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no archive is attached, or the
    /// store error if the query fails.
    pub async fn failed_deliveries(
        &self,
        filter: DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>> {
        let store = self.dead_letter_store()?;
        Ok(store.find(filter).await?)
    }

    fn dead_letter_store(&self) -> Result<&Arc<dyn DeadLetterStore>> {
        self.dead_letters
            .as_ref()
            .ok_or_else(|| DeliveryError::configuration("no dead letter store attached"))
    }

    fn record_attempt(&self, delivery: &Delivery, result: &Result<SendReceipt>) {
        let Some(metrics) = &self.metrics else { return };

        let labels: BTreeMap<String, String> =
            [("webhook_id".to_string(), delivery.webhook_id.to_string())].into();

        match result {
            Ok(receipt) => {
                metrics.increment("webhook_send_success", &labels);
                if let Some(ms) = receipt.response_time_ms {
                    metrics.observe("webhook_response_time_ms", f64::from(ms), &labels);
                }
            },
            Err(_) => metrics.increment("webhook_send_failure", &labels),
        }
    }
}

impl DeliveryHandler for QueueProcessor {
    /// Resolves config and delegates to the sender.
    ///
    /// A delivery whose webhook has no resolvable config fails this
    /// attempt; the retry policy decides its fate from attempt counts,
    /// not from the error class.
    fn handle(&self, delivery: Delivery) -> BoxFuture<'_, Result<SendReceipt>> {
        Box::pin(async move {
            let Some(config) = self.resolve_config(delivery.webhook_id).await? else {
                debug!(
                    delivery_id = %delivery.id,
                    webhook_id = %delivery.webhook_id,
                    "no webhook config for delivery"
                );
                let failure = DeliveryError::missing_config(delivery.webhook_id);
                self.record_attempt(&delivery, &Err(failure.clone()));
                return Err(failure);
            };

            let result = self.sender.send_webhook(&config, &delivery).await;
            self.record_attempt(&delivery, &result);
            result
        })
    }
}
