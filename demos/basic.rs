use std::sync::Arc;
use std::time::Duration;

use webhook_outbox::{
    DeliveryStatus, FlakyTransport, InMemoryStore, NewEvent, Outbox, OutboxConfig,
};

#[tokio::main]
async fn main() {
    let store = Arc::new(InMemoryStore::new());

    // Fails twice, then delivers; watch the backoff do its thing.
    let transport = Arc::new(FlakyTransport::failing(2));

    let config = OutboxConfig {
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let mut outbox = Outbox::start(store, transport, config);

    let admission = outbox
        .admit(
            NewEvent::new("evt_123", "payment.captured", r#"{"amount":1200}"#)
                .with_transaction_id("tx_1")
                .with_max_retries(5),
        )
        .await
        .expect("admission failed");
    let id = admission.event().id;

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(event)) = outbox.event(id).await {
            println!(
                "event {id}: {} (retries {})",
                event.status, event.retry_count
            );
            if event.status == DeliveryStatus::Delivered {
                break;
            }
        }
    }

    outbox.shutdown().await;
}
