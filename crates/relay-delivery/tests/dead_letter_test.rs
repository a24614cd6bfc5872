//! Dead letter archive operations against the in-memory store.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use relay_core::{
    BlockchainEvent, Clock, DeadLetterEntry, DeadLetterFilter, DeliveryId, Json, SubscriptionId,
    TestClock, WebhookId,
};
use relay_delivery::store::{mock::MockDeadLetterStore, DeadLetterStore};

fn entry(
    webhook_id: WebhookId,
    reason: &str,
    failed_at: chrono::DateTime<chrono::Utc>,
) -> DeadLetterEntry {
    DeadLetterEntry {
        id: DeliveryId::new(),
        subscription_id: SubscriptionId::new(),
        webhook_id,
        event: Json(BlockchainEvent {
            contract_address: "0x1234".to_string(),
            event_name: "Transfer".to_string(),
            block_number: 7,
            transaction_hash: "0xfeed".to_string(),
            log_index: 0,
            args: BTreeMap::new(),
            timestamp: failed_at,
        }),
        payload: Json(serde_json::json!({})),
        failure_reason: reason.to_string(),
        failed_at,
        attempts: 3,
        last_error: Some("connection refused".to_string()),
    }
}

#[tokio::test]
async fn find_filters_by_webhook() {
    let store = Arc::new(MockDeadLetterStore::new());
    let target = WebhookId::new();
    let now = Utc::now();

    store.add(entry(target, "retries exhausted", now)).await.unwrap();
    store.add(entry(WebhookId::new(), "retries exhausted", now)).await.unwrap();

    let filter = DeadLetterFilter { webhook_id: Some(target), ..DeadLetterFilter::default() };
    let found = store.find(filter).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].webhook_id, target);

    let all = store.find(DeadLetterFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn remove_reports_existence() {
    let store = Arc::new(MockDeadLetterStore::new());
    let archived = entry(WebhookId::new(), "retries exhausted", Utc::now());
    let id = archived.id;
    store.add(archived).await.unwrap();

    assert!(store.remove(id).await.unwrap());
    assert!(!store.remove(id).await.unwrap());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn retention_cleanup_deletes_old_entries_only() {
    let store = Arc::new(MockDeadLetterStore::new());
    let clock = TestClock::new();
    let now = clock.now_utc();

    store.add(entry(WebhookId::new(), "retries exhausted", now - chrono::Duration::days(30))).await.unwrap();
    store.add(entry(WebhookId::new(), "retries exhausted", now)).await.unwrap();

    let deleted = store.delete_older_than(now - chrono::Duration::days(7)).await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn stats_count_windows_and_rank_reasons() {
    let store = Arc::new(MockDeadLetterStore::new());
    let clock = TestClock::new();
    clock.advance(Duration::from_secs(3600 * 24 * 30));
    let now = clock.now_utc();

    for _ in 0..3 {
        store.add(entry(WebhookId::new(), "retries exhausted", now)).await.unwrap();
    }
    store
        .add(entry(WebhookId::new(), "non-retryable failure", now - chrono::Duration::days(3)))
        .await
        .unwrap();
    store
        .add(entry(WebhookId::new(), "non-retryable failure", now - chrono::Duration::days(10)))
        .await
        .unwrap();

    let stats = store.stats(now, 10).await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.last_24h, 3);
    assert_eq!(stats.last_7d, 4);
    assert_eq!(stats.top_reasons[0], ("retries exhausted".to_string(), 3));
    assert_eq!(stats.top_reasons[1], ("non-retryable failure".to_string(), 2));
}
