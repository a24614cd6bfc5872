//! Delivery queue behavior against in-memory stores.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use relay_core::{
    BlockchainEvent, Clock, Delivery, DeliveryStatus, SubscriptionId, TestClock, WebhookId,
};
use relay_delivery::{
    queue::{DeliveryHandler, DeliveryQueue, QueueConfig},
    sender::SendReceipt,
    store::{
        mock::{MockDeadLetterStore, MockDeliveryStore},
        BoxFuture, DeliveryStore,
    },
    DeliveryError, ExponentialBackoff, Result,
};
use tokio::sync::Mutex;

fn sample_event() -> BlockchainEvent {
    BlockchainEvent {
        contract_address: "0x1234".to_string(),
        event_name: "Transfer".to_string(),
        block_number: 100,
        transaction_hash: "0xfeed".to_string(),
        log_index: 0,
        args: BTreeMap::new(),
        timestamp: Utc::now(),
    }
}

fn sample_delivery(max_attempts: i32) -> Delivery {
    Delivery::new(
        SubscriptionId::new(),
        WebhookId::new(),
        sample_event(),
        serde_json::json!({"text": "transfer observed"}),
        max_attempts,
        Utc::now(),
    )
}

/// Handler driven by a scripted queue of outcomes; succeeds with a 200
/// receipt once the script runs out.
#[derive(Default)]
struct ScriptedHandler {
    script: Mutex<Vec<Result<SendReceipt>>>,
}

impl ScriptedHandler {
    fn failing_times(n: usize) -> Self {
        let script = (0..n)
            .map(|_| Err(DeliveryError::send_failed("connection refused")))
            .collect();
        Self { script: Mutex::new(script) }
    }
}

impl DeliveryHandler for ScriptedHandler {
    fn handle(&self, _delivery: Delivery) -> BoxFuture<'_, Result<SendReceipt>> {
        Box::pin(async move {
            self.script.lock().await.pop().unwrap_or(Ok(SendReceipt {
                response_status: Some(200),
                response_time_ms: Some(8),
            }))
        })
    }
}

fn queue_with(
    store: Arc<MockDeliveryStore>,
    clock: Arc<TestClock>,
    max_concurrent: usize,
) -> DeliveryQueue {
    let config = QueueConfig { max_concurrent, ..QueueConfig::default() };
    DeliveryQueue::new(store, clock, config)
}

#[tokio::test]
async fn enqueue_normalizes_initial_state() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10);

    let mut delivery = sample_delivery(3);
    delivery.status = DeliveryStatus::Processing;
    delivery.attempts = 2;
    delivery.next_retry = Some(Utc::now());

    let id = queue.enqueue(delivery).await.unwrap();

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(stored.next_retry.is_none());
}

#[tokio::test]
async fn dequeue_claims_and_counts() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();

    let claimed = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, DeliveryStatus::Processing);
    assert_eq!(queue.processing_count(), 1);

    // Nothing else eligible: the failed claim releases its slot.
    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(queue.processing_count(), 1);
}

#[tokio::test]
async fn dequeue_applies_backpressure_at_cap() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 2);

    for _ in 0..3 {
        queue.enqueue(sample_delivery(3)).await.unwrap();
    }

    assert!(queue.dequeue().await.unwrap().is_some());
    assert!(queue.dequeue().await.unwrap().is_some());
    // Third delivery is due but the cap is reached.
    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(queue.processing_count(), 2);
}

#[tokio::test]
async fn claim_error_releases_reserved_slot() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 1);

    queue.enqueue(sample_delivery(3)).await.unwrap();

    store.inject_error("connection reset").await;
    assert!(queue.dequeue().await.is_err());
    assert_eq!(queue.processing_count(), 0);

    // The slot is free again for the next claim.
    assert!(queue.dequeue().await.unwrap().is_some());
}

#[tokio::test]
async fn processing_count_decrement_is_floored() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();

    queue.mark_complete(id).await.unwrap();
    assert_eq!(queue.processing_count(), 0);

    // A second release, e.g. after a maintenance reset raced the worker,
    // must not underflow.
    queue.mark_complete(id).await.unwrap();
    assert_eq!(queue.processing_count(), 0);
}

#[tokio::test]
async fn successful_delivery_is_completed_with_response() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10);
    let handler = ScriptedHandler::default();

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Completed);
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.response_status, Some(200));
    assert_eq!(queue.processing_count(), 0);
}

#[tokio::test]
async fn failed_delivery_is_rescheduled_with_backoff() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock.clone(), 10);
    let handler = ScriptedHandler::failing_times(1);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempts, 1);
    // First retry: base 1000ms with jitter in [1.0, 1.5).
    let delay = stored.next_retry.unwrap() - clock.now_utc();
    assert!(delay >= chrono::Duration::seconds(2));
    assert!(delay < chrono::Duration::seconds(3));
    assert_eq!(queue.processing_count(), 0);
}

#[tokio::test]
async fn rescheduled_delivery_not_claimable_before_retry_time() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock.clone(), 10);
    let handler = ScriptedHandler::failing_times(1);

    queue.enqueue(sample_delivery(3)).await.unwrap();
    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    assert!(queue.dequeue().await.unwrap().is_none());

    clock.advance(Duration::from_secs(10));
    assert!(queue.dequeue().await.unwrap().is_some());
}

#[tokio::test]
async fn last_failure_within_budget_schedules_final_retry() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10);
    let handler = ScriptedHandler::failing_times(1);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    let mut raw = store.get(id).await.unwrap();
    raw.attempts = 2;
    store.insert_raw(raw).await;

    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    // Budget still allows one more attempt, so the failure at attempts=2
    // schedules a retry carrying the full budget.
    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempts, 3);
}

#[tokio::test]
async fn exhausted_delivery_fails_and_dead_letters() {
    let store = Arc::new(MockDeliveryStore::new());
    let dead_letters = Arc::new(MockDeadLetterStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10)
        .with_dead_letter_store(dead_letters.clone());
    let handler = ScriptedHandler::failing_times(1);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    let mut raw = store.get(id).await.unwrap();
    raw.attempts = 3;
    store.insert_raw(raw).await;

    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert!(stored.error_message.is_some());

    let entry = dead_letters.get(id).await.unwrap();
    assert_eq!(entry.failure_reason, "retries exhausted");
    assert_eq!(entry.attempts, 3);
    assert!(entry.last_error.is_some());
}

#[tokio::test]
async fn dead_letter_archive_failure_is_not_fatal() {
    let store = Arc::new(MockDeliveryStore::new());
    let dead_letters = Arc::new(MockDeadLetterStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10)
        .with_dead_letter_store(dead_letters.clone());
    let handler = ScriptedHandler::failing_times(1);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    let mut raw = store.get(id).await.unwrap();
    raw.attempts = 3;
    store.insert_raw(raw).await;

    dead_letters.inject_error("archive unavailable").await;

    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    // Terminal status in the main store is the source of truth.
    assert_eq!(store.get(id).await.unwrap().status, DeliveryStatus::Failed);
    assert!(dead_letters.is_empty().await);
}

#[tokio::test]
async fn oldest_due_delivery_claimed_first() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 10);

    let mut first = sample_delivery(3);
    first.created_at = Utc::now() - chrono::Duration::minutes(5);
    let first_id = first.id;
    store.insert_raw(first).await;
    queue.enqueue(sample_delivery(3)).await.unwrap();

    let claimed = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(claimed.id, first_id);
}

#[tokio::test]
async fn stats_merge_live_and_persisted_views() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock, 7);

    queue.enqueue(sample_delivery(3)).await.unwrap();
    queue.enqueue(sample_delivery(3)).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processing_count, 1);
    assert_eq!(stats.max_concurrent, 7);
    assert_eq!(stats.counts.pending, 1);
    assert_eq!(stats.counts.processing, 1);
    assert_eq!(queue.queue_size().await.unwrap(), 1);
}

#[tokio::test]
async fn stuck_deliveries_return_to_claim_pool() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock.clone(), 10);

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    assert_eq!(store.get(id).await.unwrap().status, DeliveryStatus::Processing);

    // Under the 5 minute threshold: still considered in flight.
    clock.advance(Duration::from_secs(200));
    let reset = store
        .reset_stuck(clock.now_utc(), chrono::Duration::seconds(300))
        .await
        .unwrap();
    assert_eq!(reset, 0);

    clock.advance(Duration::from_secs(200));
    let reset = store
        .reset_stuck(clock.now_utc(), chrono::Duration::seconds(300))
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert!(stored.next_retry.is_none());
}

#[tokio::test]
async fn retry_policy_swaps_at_runtime() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(TestClock::new());
    let queue = queue_with(store.clone(), clock.clone(), 10);
    let handler = ScriptedHandler::failing_times(1);

    queue
        .set_retry_schedule(Arc::new(ExponentialBackoff::new(
            Duration::from_millis(60_000),
            Duration::from_millis(60_000),
        )))
        .await;

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();
    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.process_delivery(claimed, &handler).await.unwrap();

    let delay = store.get(id).await.unwrap().next_retry.unwrap() - clock.now_utc();
    assert!(delay >= chrono::Duration::seconds(60));
}

#[tokio::test]
async fn background_loops_complete_a_delivery() {
    let store = Arc::new(MockDeliveryStore::new());
    let clock = Arc::new(relay_core::SystemClock::new());
    let config = QueueConfig {
        dispatch_interval: Duration::from_millis(10),
        ..QueueConfig::default()
    };
    let queue = Arc::new(DeliveryQueue::new(store.clone(), clock, config));

    let id = queue.enqueue(sample_delivery(3)).await.unwrap();

    queue.start_processing(Arc::new(ScriptedHandler::default()));
    // A second start while running is a no-op.
    queue.start_processing(Arc::new(ScriptedHandler::default()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.get(id).await.unwrap().status == DeliveryStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delivery never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    queue.stop_processing().await;
    queue.stop_processing().await;
    assert_eq!(queue.processing_count(), 0);
}
