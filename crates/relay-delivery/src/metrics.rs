//! In-process metrics aggregation with periodic durable flush.
//!
//! Counters, gauges, and histograms are aggregated in memory and flushed
//! to the [`MetricsStore`] on a fixed interval. Metric identity is the
//! name plus the full label set. Histograms keep a bounded window of
//! recent observations and export the p95 of that window, so the exported
//! percentile tracks recent behavior rather than all-time history.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use relay_core::{Clock, Metric, MetricKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Result, store::MetricsStore};

/// Default interval between durable flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Observations retained per histogram. Older samples fall off the window.
pub const HISTOGRAM_WINDOW: usize = 1000;

type MetricKey = (String, BTreeMap<String, String>);

#[derive(Default)]
struct Registry {
    counters: HashMap<MetricKey, f64>,
    gauges: HashMap<MetricKey, f64>,
    histograms: HashMap<MetricKey, VecDeque<f64>>,
}

struct FlushHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Aggregating metrics collector with a background flush loop.
///
/// Counters accumulate across flushes; gauges and histogram windows are
/// cleared after each successful flush. A failed flush keeps everything
/// for the next interval.
pub struct MetricsCollector {
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn Clock>,
    flush_interval: Duration,
    registry: Mutex<Registry>,
    flusher: Mutex<Option<FlushHandle>>,
}

impl MetricsCollector {
    /// Creates a collector with the default flush interval.
    pub fn new(store: Arc<dyn MetricsStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_flush_interval(store, clock, DEFAULT_FLUSH_INTERVAL)
    }

    /// Creates a collector with a custom flush interval.
    pub fn with_flush_interval(
        store: Arc<dyn MetricsStore>,
        clock: Arc<dyn Clock>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            flush_interval,
            registry: Mutex::new(Registry::default()),
            flusher: Mutex::new(None),
        }
    }

    /// Adds one to a counter.
    pub fn increment(&self, name: &str, labels: &BTreeMap<String, String>) {
        self.increment_by(name, 1.0, labels);
    }

    /// Adds an arbitrary amount to a counter.
    pub fn increment_by(&self, name: &str, amount: f64, labels: &BTreeMap<String, String>) {
        let mut registry = self.lock_registry();
        *registry.counters.entry((name.to_string(), labels.clone())).or_default() += amount;
    }

    /// Sets a gauge to the given value, replacing any previous value.
    pub fn set_gauge(&self, name: &str, value: f64, labels: &BTreeMap<String, String>) {
        let mut registry = self.lock_registry();
        registry.gauges.insert((name.to_string(), labels.clone()), value);
    }

    /// Records one histogram observation, evicting the oldest sample once
    /// the window is full.
    pub fn observe(&self, name: &str, value: f64, labels: &BTreeMap<String, String>) {
        let mut registry = self.lock_registry();
        let window = registry.histograms.entry((name.to_string(), labels.clone())).or_default();
        window.push_back(value);
        if window.len() > HISTOGRAM_WINDOW {
            window.pop_front();
        }
    }

    /// Builds flushable samples from the current aggregates.
    ///
    /// Histograms with no observations are skipped rather than exported
    /// as zero.
    pub fn snapshot(&self) -> Vec<Metric> {
        let timestamp = self.clock.now_utc();
        let registry = self.lock_registry();
        let mut samples = Vec::with_capacity(
            registry.counters.len() + registry.gauges.len() + registry.histograms.len(),
        );

        for ((name, labels), value) in &registry.counters {
            samples.push(Metric {
                name: name.clone(),
                kind: MetricKind::Counter,
                value: *value,
                labels: labels.clone(),
                timestamp,
            });
        }
        for ((name, labels), value) in &registry.gauges {
            samples.push(Metric {
                name: name.clone(),
                kind: MetricKind::Gauge,
                value: *value,
                labels: labels.clone(),
                timestamp,
            });
        }
        for ((name, labels), window) in &registry.histograms {
            if let Some(p95) = percentile_95(window) {
                samples.push(Metric {
                    name: name.clone(),
                    kind: MetricKind::Histogram,
                    value: p95,
                    labels: labels.clone(),
                    timestamp,
                });
            }
        }

        samples
    }

    /// Flushes current aggregates to the store.
    ///
    /// On success gauges and histogram windows are cleared; counters keep
    /// accumulating. On failure nothing is cleared, so the next flush
    /// retries with the same (and any newer) data.
    ///
    /// # Errors
    ///
    /// Returns error if the store write fails.
    pub async fn flush(&self) -> Result<()> {
        let samples = self.snapshot();
        if samples.is_empty() {
            return Ok(());
        }

        self.store.write_all(samples).await?;

        let mut registry = self.lock_registry();
        registry.gauges.clear();
        registry.histograms.clear();
        Ok(())
    }

    /// Starts the periodic flush loop.
    ///
    /// A second call while the loop is running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if flusher.is_some() {
            debug!("metrics flush loop already started");
            return;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_flush_loop(Arc::clone(self), token.clone()));
        *flusher = Some(FlushHandle { token, task });
        info!(
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "metrics collector started"
        );
    }

    /// Stops the flush loop and performs one final flush.
    ///
    /// Idempotent. A failed final flush is logged; accumulated data is
    /// dropped with the collector.
    pub async fn stop(&self) {
        let handle = self.flusher.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else { return };

        handle.token.cancel();
        let _ = handle.task.await;

        if let Err(error) = self.flush().await {
            warn!(error = %error, "final metrics flush failed");
        }
        info!("metrics collector stopped");
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_flush_loop(collector: Arc<MetricsCollector>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = collector.clock.sleep(collector.flush_interval) => {},
            () = token.cancelled() => break,
        }

        if let Err(error) = collector.flush().await {
            warn!(error = %error, "periodic metrics flush failed");
        }
    }
    debug!("metrics flush loop stopped");
}

/// p95 over the retained window: the value at rank `ceil(0.95 * n)`.
fn percentile_95(window: &VecDeque<f64>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }

    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    Some(sorted[rank.saturating_sub(1)])
}
