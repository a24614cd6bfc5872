//! Read-through TTL cache for webhook configuration.
//!
//! Webhook config is read on every delivery but changes rarely, so the
//! processor keeps a per-entry TTL cache in front of the configuration
//! store. Expiry is evaluated against the injected [`Clock`], which keeps
//! TTL behavior testable without real waits.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use relay_core::{Clock, WebhookConfig, WebhookId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{error::Result, store::ConfigStore};

/// Default time-to-live for cached config entries (5 minutes).
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(300);

/// Cache occupancy and effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently cached, fresh or expired.
    pub entries: usize,
    /// Lookups answered from a fresh entry.
    pub hits: u64,
    /// Lookups that had to query the store.
    pub misses: u64,
}

#[derive(Debug, Clone)]
struct CachedConfig {
    config: WebhookConfig,
    expires_at: DateTime<Utc>,
}

/// TTL cache in front of a [`ConfigStore`].
pub struct WebhookConfigCache {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    entries: RwLock<HashMap<WebhookId, CachedConfig>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl WebhookConfigCache {
    /// Creates a cache with the default TTL.
    pub fn new(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(store, clock, DEFAULT_CONFIG_TTL)
    }

    /// Creates a cache with a custom TTL.
    pub fn with_ttl(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5)),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a webhook config, querying the store on a miss or expiry.
    ///
    /// A store `None` (endpoint deactivated or deleted) evicts any stale
    /// entry so deliveries stop resolving it within one TTL window.
    ///
    /// # Errors
    ///
    /// Returns error if the cache missed and the store query failed. A
    /// fresh cached entry never touches the store.
    pub async fn get(&self, id: WebhookId) -> Result<Option<WebhookConfig>> {
        let now = self.clock.now_utc();

        if let Some(entry) = self.entries.read().await.get(&id) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::AcqRel);
                return Ok(Some(entry.config.clone()));
            }
        }

        self.misses.fetch_add(1, Ordering::AcqRel);
        match self.store.find_active(id).await? {
            Some(config) => {
                self.entries.write().await.insert(
                    id,
                    CachedConfig { config: config.clone(), expires_at: now + self.ttl },
                );
                Ok(Some(config))
            },
            None => {
                self.entries.write().await.remove(&id);
                Ok(None)
            },
        }
    }

    /// Replaces the entire cache with all currently active configs and
    /// returns them.
    ///
    /// Used at startup to warm the cache in one query.
    ///
    /// # Errors
    ///
    /// Returns error if the store query fails; the cache is left as-is.
    pub async fn load_all(&self) -> Result<Vec<WebhookConfig>> {
        let configs = self.store.find_all_active().await?;
        let expires_at = self.clock.now_utc() + self.ttl;

        let mut entries = self.entries.write().await;
        entries.clear();
        for config in &configs {
            entries.insert(config.id, CachedConfig { config: config.clone(), expires_at });
        }
        debug!(entries = entries.len(), "webhook config cache loaded");
        Ok(configs)
    }

    /// Periodic refresh: reload all active configs, keeping the existing
    /// cache intact if the store is unavailable.
    ///
    /// Stale config is better than none while the database recovers, so
    /// a failed refresh is a warning and the previous entries keep
    /// serving until they expire individually.
    ///
    /// # Errors
    ///
    /// Returns the store error after logging it; entries are untouched.
    pub async fn refresh(&self) -> Result<usize> {
        match self.load_all().await {
            Ok(configs) => Ok(configs.len()),
            Err(error) => {
                warn!(error = %error, "config cache refresh failed, keeping cached entries");
                Err(error)
            },
        }
    }

    /// Drops one entry, forcing the next lookup through the store.
    pub async fn invalidate(&self, id: WebhookId) {
        self.entries.write().await.remove(&id);
    }

    /// Drops all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Current occupancy and hit/miss counters.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().await.len(),
            hits: self.hits.load(Ordering::Acquire),
            misses: self.misses.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use relay_core::{time::TestClock, WebhookFormat};

    use super::*;
    use crate::store::mock::MockConfigStore;

    fn config(id: WebhookId) -> WebhookConfig {
        WebhookConfig {
            id,
            url: "https://example.com/hook".to_string(),
            format: WebhookFormat::Generic,
            headers: BTreeMap::new(),
            timeout_seconds: 30,
            retry_attempts: 3,
        }
    }

    #[tokio::test]
    async fn one_store_query_per_ttl_window() {
        let store = Arc::new(MockConfigStore::new());
        let clock = Arc::new(TestClock::new());
        let id = WebhookId::new();
        store.put(config(id)).await;

        let cache = WebhookConfigCache::new(store.clone(), clock.clone());

        for _ in 0..5 {
            assert!(cache.get(id).await.unwrap().is_some());
        }
        assert_eq!(store.query_count(), 1);

        clock.advance(Duration::from_secs(301));
        assert!(cache.get(id).await.unwrap().is_some());
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn deactivated_config_evicted_on_expiry() {
        let store = Arc::new(MockConfigStore::new());
        let clock = Arc::new(TestClock::new());
        let id = WebhookId::new();
        store.put(config(id)).await;

        let cache = WebhookConfigCache::new(store.clone(), clock.clone());
        assert!(cache.get(id).await.unwrap().is_some());

        store.delete(id).await;
        // Still served from cache inside the window.
        assert!(cache.get(id).await.unwrap().is_some());

        clock.advance(Duration::from_secs(301));
        assert!(cache.get(id).await.unwrap().is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_existing_entries() {
        let store = Arc::new(MockConfigStore::new());
        let clock = Arc::new(TestClock::new());
        let id = WebhookId::new();
        store.put(config(id)).await;

        let cache = WebhookConfigCache::new(store.clone(), clock.clone());
        assert_eq!(cache.load_all().await.unwrap().len(), 1);

        store.set_failing(true).await;
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.stats().await.entries, 1);

        // Cached entry keeps serving without touching the failing store.
        assert!(cache.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn miss_with_failing_store_propagates() {
        let store = Arc::new(MockConfigStore::new());
        let clock = Arc::new(TestClock::new());
        store.set_failing(true).await;

        let cache = WebhookConfigCache::new(store, clock);
        assert!(cache.get(WebhookId::new()).await.is_err());
    }

    #[tokio::test]
    async fn hit_and_miss_counters() {
        let store = Arc::new(MockConfigStore::new());
        let clock = Arc::new(TestClock::new());
        let id = WebhookId::new();
        store.put(config(id)).await;

        let cache = WebhookConfigCache::new(store, clock);
        cache.get(id).await.unwrap();
        cache.get(id).await.unwrap();
        cache.get(WebhookId::new()).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }
}
