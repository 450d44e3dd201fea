use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use webhook_outbox::{
    Admission, CancelOutcome, Clock, DeliveryStatus, FailureReason, FlakyTransport,
    InMemoryLedger, InMemoryStore, ManualClock, NewEvent, Outbox, OutboxConfig, RetryPolicy,
    Transport, WebhookEvent,
};

fn test_config() -> OutboxConfig {
    OutboxConfig {
        worker_count: 1,
        batch_size: 10,
        poll_interval: Duration::from_millis(10),
        attempt_timeout: Duration::from_secs(5),
        // No jitter so scheduled retry times are exact.
        retry: RetryPolicy {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(60_000),
            jitter: Duration::ZERO,
        },
        ..Default::default()
    }
}

fn paused_outbox(transport: Arc<dyn Transport>) -> (Outbox, Arc<InMemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let outbox = Outbox::paused_with_clock(store.clone(), transport, test_config(), clock.clone());
    (outbox, store, clock)
}

async fn admitted(outbox: &Outbox, new: NewEvent) -> WebhookEvent {
    match outbox.admit(new).await.unwrap() {
        Admission::Admitted(event) => event,
        Admission::Duplicate(event) => panic!("unexpected duplicate of event {}", event.id),
    }
}

#[tokio::test]
async fn test_duplicate_admission_returns_first_row() {
    let (outbox, _, _) = paused_outbox(Arc::new(FlakyTransport::failing(0)));

    let payload = serde_json::json!({"amount": 1200, "currency": "EUR"}).to_string();
    let first = admitted(&outbox, NewEvent::new("idem-1", "payment.captured", payload.clone())).await;

    // Same key, different payload: the original row wins, unchanged.
    let again = outbox
        .admit(NewEvent::new(
            "idem-1",
            "payment.captured",
            serde_json::json!({"amount": 9999}).to_string(),
        ))
        .await
        .unwrap();
    match again {
        Admission::Duplicate(event) => {
            assert_eq!(event.id, first.id);
            assert_eq!(event.payload, payload.as_bytes());
        }
        Admission::Admitted(_) => panic!("duplicate key admitted twice"),
    }

    assert_eq!(
        outbox.count_by_status(DeliveryStatus::Pending).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_delivers_on_first_attempt() {
    let transport = Arc::new(FlakyTransport::failing(0));
    let (outbox, _, clock) = paused_outbox(transport.clone());

    let event = admitted(&outbox, NewEvent::new("idem-1", "payment.captured", "{}")).await;
    assert_eq!(outbox.run_once().await, 1);

    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.delivered_at, Some(clock.now_ms()));
    assert_eq!(row.next_retry_at, None);
    assert_eq!(transport.attempts(), 1);

    // Nothing is due afterwards.
    assert_eq!(outbox.run_once().await, 0);
}

#[tokio::test]
async fn test_retries_then_succeeds() {
    // Fails twice, succeeds on the third attempt.
    let transport = Arc::new(FlakyTransport::failing(2));
    let (outbox, _, clock) = paused_outbox(transport.clone());

    let event = admitted(
        &outbox,
        NewEvent::new("idem-1", "payment.captured", "{\"amount\":1200}")
            .with_transaction_id("tx1")
            .with_max_retries(3),
    )
    .await;

    // First attempt fails and reschedules one base delay out.
    assert_eq!(outbox.run_once().await, 1);
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.next_retry_at, Some(clock.now_ms() + 1_000));
    assert!(row.last_error.is_some());

    // Not due yet.
    assert_eq!(outbox.run_once().await, 0);

    // Second attempt fails, backoff doubles.
    clock.advance(1_000);
    assert_eq!(outbox.run_once().await, 1);
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 2);
    assert_eq!(row.next_retry_at, Some(clock.now_ms() + 2_000));

    // Third attempt succeeds.
    clock.advance(2_000);
    assert_eq!(outbox.run_once().await, 1);
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.retry_count, 2);
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test]
async fn test_budget_exhaustion_parks_event_as_failed() {
    let transport = Arc::new(FlakyTransport::failing(100));
    let (outbox, _, clock) = paused_outbox(transport.clone());

    let event = admitted(
        &outbox,
        NewEvent::new("idem-1", "order.created", "{}").with_max_retries(3),
    )
    .await;

    for _ in 0..3 {
        assert_eq!(outbox.run_once().await, 1);
        clock.advance(120_000);
    }

    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert_eq!(row.next_retry_at, None);
    assert!(row.last_error.is_some());

    // Exhausted events are never attempted again.
    assert_eq!(outbox.run_once().await, 0);
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test]
async fn test_redrive_gives_failed_events_a_fresh_budget() {
    let transport = Arc::new(FlakyTransport::failing(2));
    let (outbox, _, clock) = paused_outbox(transport.clone());

    let event = admitted(
        &outbox,
        NewEvent::new("idem-1", "order.created", "{}").with_max_retries(2),
    )
    .await;

    for _ in 0..2 {
        assert_eq!(outbox.run_once().await, 1);
        clock.advance(120_000);
    }
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);

    // Redrive resets the budget; the transport has recovered.
    assert_eq!(outbox.redrive_failed(50).await.unwrap(), 1);
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 0);

    assert_eq!(outbox.run_once().await, 1);
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_blocks_delivery() {
    let (outbox, _, _) = paused_outbox(Arc::new(FlakyTransport::failing(0)));

    let event = admitted(&outbox, NewEvent::new("idem-1", "order.created", "{}")).await;

    assert_eq!(outbox.cancel(event.id).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(
        outbox.cancel(event.id).await.unwrap(),
        CancelOutcome::AlreadyCancelled
    );

    assert_eq!(outbox.run_once().await, 0);
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Cancelled);
}

#[tokio::test]
async fn test_ledger_deletion_preserves_audit_history() {
    let (outbox, _, _) = paused_outbox(Arc::new(FlakyTransport::failing(0)));

    let event = admitted(
        &outbox,
        NewEvent::new("idem-1", "payment.captured", "{\"amount\":1200}")
            .with_transaction_id("tx1"),
    )
    .await;
    assert_eq!(outbox.run_once().await, 1);

    let cleared = outbox
        .on_transaction_deleted(&event.transaction_id.clone().unwrap())
        .await
        .unwrap();
    assert_eq!(cleared, 1);

    // The event survives with its history; only the reference is gone.
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.transaction_id, None);
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert!(row.delivered_at.is_some());
}

#[tokio::test]
async fn test_reconcile_clears_only_dangling_references() {
    let (outbox, _, _) = paused_outbox(Arc::new(FlakyTransport::failing(0)));

    let ledger = InMemoryLedger::new();
    let tx1 = ledger.insert("tx1").await;

    let kept = admitted(
        &outbox,
        NewEvent::new("idem-1", "payment.captured", "{}").with_transaction_id("tx1"),
    )
    .await;
    let dangling = admitted(
        &outbox,
        NewEvent::new("idem-2", "payment.captured", "{}").with_transaction_id("tx2"),
    )
    .await;

    assert_eq!(outbox.reconcile_ledger(&ledger).await.unwrap(), 1);

    let kept = outbox.event(kept.id).await.unwrap().unwrap();
    assert_eq!(kept.transaction_id, Some(tx1));
    let dangling = outbox.event(dangling.id).await.unwrap().unwrap();
    assert_eq!(dangling.transaction_id, None);
}

#[tokio::test]
async fn test_sweep_frees_the_key_for_reuse() {
    let (outbox, _, clock) = paused_outbox(Arc::new(FlakyTransport::failing(0)));

    let event = admitted(&outbox, NewEvent::new("idem-1", "order.created", "{}")).await;
    assert_eq!(outbox.run_once().await, 1);

    // Inside the retention window nothing is swept.
    assert_eq!(outbox.sweep_now().await.unwrap(), 0);

    clock.advance(31 * 24 * 60 * 60 * 1_000);
    assert_eq!(outbox.sweep_now().await.unwrap(), 1);

    // Soft-deleted: invisible to the key lookup, still fetchable by id.
    assert!(outbox.find_by_key(&event.idempotency_key).await.unwrap().is_none());
    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);

    // The key is live again for a fresh event.
    let fresh = admitted(&outbox, NewEvent::new("idem-1", "order.created", "{}")).await;
    assert_ne!(fresh.id, event.id);
}

#[tokio::test]
async fn test_purge_removes_long_deleted_rows() {
    let (outbox, _, clock) = paused_outbox(Arc::new(FlakyTransport::failing(0)));

    let event = admitted(&outbox, NewEvent::new("idem-1", "order.created", "{}")).await;
    assert_eq!(outbox.run_once().await, 1);

    clock.advance(31 * 24 * 60 * 60 * 1_000);
    assert_eq!(outbox.sweep_now().await.unwrap(), 1);

    // Still inside the purge window.
    assert_eq!(outbox.purge_now().await.unwrap(), 0);

    clock.advance(91 * 24 * 60 * 60 * 1_000);
    assert_eq!(outbox.purge_now().await.unwrap(), 1);
    assert!(outbox.event(event.id).await.unwrap().is_none());
}

struct HangingTransport;

#[async_trait]
impl Transport for HangingTransport {
    async fn deliver(&self, _event: &WebhookEvent) -> Result<(), FailureReason> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_attempt_timeout_counts_as_failure() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let config = OutboxConfig {
        attempt_timeout: Duration::from_millis(20),
        ..test_config()
    };
    let outbox = Outbox::paused_with_clock(store, Arc::new(HangingTransport), config, clock);

    let event = admitted(&outbox, NewEvent::new("idem-1", "order.created", "{}")).await;
    assert_eq!(outbox.run_once().await, 1);

    let row = outbox.event(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("request timed out"));
}

#[tokio::test]
async fn test_background_workers_deliver_admitted_events() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(FlakyTransport::failing(0));
    let config = OutboxConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(10),
        ..test_config()
    };

    let mut outbox = Outbox::start(store, transport, config);
    assert!(outbox.is_running());

    let event = admitted(&outbox, NewEvent::new("idem-1", "order.created", "{}")).await;

    // Give workers time to pick it up.
    let mut delivered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let row = outbox.event(event.id).await.unwrap().unwrap();
        if row.status == DeliveryStatus::Delivered {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "workers never delivered the event");

    outbox.shutdown().await;
    assert!(!outbox.is_running());
}
