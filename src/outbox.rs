use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AdmitError, FailureReason, StoreError};
use crate::gate::{self, Admission};
use crate::ledger::LedgerView;
use crate::retention::RetentionPolicy;
use crate::retry::RetryPolicy;
use crate::store::{CancelOutcome, EventStore};
use crate::transport::Transport;
use crate::types::{DeliveryStatus, EventId, IdempotencyKey, NewEvent, TransactionId, WebhookEvent};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Concurrent scheduler workers. Scale-out is safe: the claim
    /// transition arbitrates, nothing else is shared.
    pub worker_count: usize,

    /// Due events fetched per scheduler pass.
    pub batch_size: usize,

    /// Idle wait between polls when nothing is due.
    pub poll_interval: Duration,

    /// Bound on a single delivery attempt; elapsing counts as failure.
    pub attempt_timeout: Duration,

    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            batch_size: 10,
            poll_interval: Duration::from_millis(1_000),
            attempt_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// The delivery engine: admission, scheduling, retention, and the
/// operational query surface over one shared event store.
pub struct Outbox {
    store: Arc<dyn EventStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    notify: Arc<Notify>,
    sweeper_notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
}

impl Outbox {
    /// Start the engine: spawns `worker_count` scheduler loops and one
    /// retention sweeper against the wall clock.
    pub fn start(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
        config: OutboxConfig,
    ) -> Self {
        let mut outbox = Self::paused_with_clock(store, transport, config, Arc::new(SystemClock));
        outbox.spawn_loops();
        outbox
    }

    /// Build the engine without background tasks. Callers drive it with
    /// `run_once` / `sweep_now`; tests pair this with a manual clock.
    pub fn paused_with_clock(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
        config: OutboxConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            config,
            notify: Arc::new(Notify::new()),
            sweeper_notify: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(true)),
            worker_handles: Vec::new(),
            sweeper_handle: None,
        }
    }

    fn spawn_loops(&mut self) {
        for _ in 0..self.config.worker_count.max(1) {
            self.worker_handles.push(tokio::spawn(scheduler_loop(
                self.store.clone(),
                self.transport.clone(),
                self.clock.clone(),
                self.config.clone(),
                self.notify.clone(),
                self.is_running.clone(),
            )));
        }

        self.sweeper_handle = Some(tokio::spawn(sweeper_loop(
            self.store.clone(),
            self.clock.clone(),
            self.config.retention.clone(),
            self.sweeper_notify.clone(),
            self.is_running.clone(),
        )));
    }

    /// Route an inbound notification through the idempotency gate.
    ///
    /// Admitted events are immediately eligible; workers are woken.
    /// Duplicates return the existing row and wake nobody.
    pub async fn admit(&self, new: NewEvent) -> Result<Admission, AdmitError> {
        let admission = gate::admit(self.store.as_ref(), new, self.clock.now_ms()).await?;
        match &admission {
            Admission::Admitted(_) => {
                metric_inc("outbox.admitted");
                self.notify.notify_one();
            }
            Admission::Duplicate(_) => metric_inc("outbox.duplicate"),
        }
        Ok(admission)
    }

    pub async fn event(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError> {
        self.store.get(id).await
    }

    pub async fn find_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        self.store.find_by_key(key).await
    }

    /// Administrative cancellation; idempotent, see `CancelOutcome`.
    pub async fn cancel(&self, id: EventId) -> Result<CancelOutcome, StoreError> {
        let outcome = self.store.cancel(id, self.clock.now_ms()).await?;
        if outcome == CancelOutcome::Cancelled {
            metric_inc("outbox.cancelled");
        }
        Ok(outcome)
    }

    /// Reset the budget of up to `limit` FAILED events and wake workers.
    pub async fn redrive_failed(&self, limit: usize) -> Result<u64, StoreError> {
        let redriven = self.store.redrive_failed(limit, self.clock.now_ms()).await?;
        if redriven > 0 {
            debug!(redriven, "failed events redriven");
            self.notify.notify_waiters();
        }
        Ok(redriven)
    }

    /// React to a ledger row's removal: clear every reference to it,
    /// leaving the events and their history untouched.
    pub async fn on_transaction_deleted(&self, tx: &TransactionId) -> Result<u64, StoreError> {
        let cleared = self
            .store
            .clear_transaction_refs(tx, self.clock.now_ms())
            .await?;
        if cleared > 0 {
            debug!(tx = tx.as_str(), cleared, "ledger reference cleared");
        }
        Ok(cleared)
    }

    /// Clear references to ledger rows that no longer exist.
    pub async fn reconcile_ledger(&self, ledger: &dyn LedgerView) -> Result<u64, StoreError> {
        let mut cleared = 0;
        for tx in self.store.referenced_transactions().await? {
            if !ledger.transaction_exists(&tx).await? {
                cleared += self.on_transaction_deleted(&tx).await?;
            }
        }
        Ok(cleared)
    }

    /// Run one scheduler pass now. Returns settled attempts.
    pub async fn run_once(&self) -> usize {
        process_due_batch(
            self.store.as_ref(),
            self.transport.as_ref(),
            self.clock.as_ref(),
            &self.config,
        )
        .await
    }

    /// Soft-delete terminal events past the retention horizon.
    pub async fn sweep_now(&self) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let swept = self
            .store
            .sweep(self.config.retention.sweep_cutoff(now), now)
            .await?;
        if swept > 0 {
            debug!(swept, "terminal events soft-deleted");
        }
        Ok(swept)
    }

    /// Operator-triggered hard purge of long-soft-deleted rows.
    pub async fn purge_now(&self) -> Result<u64, StoreError> {
        let cutoff = self.config.retention.purge_cutoff(self.clock.now_ms());
        self.store.purge(cutoff).await
    }

    /// PROCESSING rows stuck past the stall threshold. Reported, never
    /// deleted; a stall means a worker died mid-attempt.
    pub async fn stalled(&self) -> Result<Vec<WebhookEvent>, StoreError> {
        let cutoff = self.config.retention.stall_cutoff(self.clock.now_ms());
        let stalled = self.store.stalled_processing(cutoff).await?;
        for event in &stalled {
            warn!(
                id = event.id.0,
                updated_at = event.updated_at,
                "event stalled in PROCESSING"
            );
        }
        Ok(stalled)
    }

    pub async fn list_by_status(
        &self,
        status: DeliveryStatus,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        self.store.list_by_status(status, include_deleted, limit).await
    }

    pub async fn list_by_transaction(
        &self,
        tx: &TransactionId,
        include_deleted: bool,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        self.store.list_by_transaction(tx, include_deleted).await
    }

    pub async fn list_by_event_type(
        &self,
        event_type: &str,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        self.store
            .list_by_event_type(event_type, include_deleted, limit)
            .await
    }

    pub async fn count_by_status(&self, status: DeliveryStatus) -> Result<u64, StoreError> {
        self.store.count_by_status(status).await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop the loops and wait for them to drain. In-flight attempts
    /// finish; nothing new is claimed.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.sweeper_notify.notify_waiters();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.sweeper_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn scheduler_loop(
    store: Arc<dyn EventStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
) {
    while is_running.load(Ordering::SeqCst) {
        let settled =
            process_due_batch(store.as_ref(), transport.as_ref(), clock.as_ref(), &config).await;

        if settled == 0 {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
}

async fn sweeper_loop(
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    retention: RetentionPolicy,
    notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
) {
    while is_running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = notify.notified() => continue,
            _ = tokio::time::sleep(retention.sweep_interval) => {}
        }

        let now = clock.now_ms();
        match store.sweep(retention.sweep_cutoff(now), now).await {
            Ok(swept) if swept > 0 => debug!(swept, "retention sweep"),
            Ok(_) => {}
            Err(err) => warn!(%err, "retention sweep failed"),
        }

        match store.stalled_processing(retention.stall_cutoff(now)).await {
            Ok(stalled) => {
                for event in stalled {
                    warn!(id = event.id.0, "event stalled in PROCESSING");
                }
            }
            Err(err) => warn!(%err, "stall check failed"),
        }
    }
}

/// One scheduler pass: fetch due events, then claim and attempt each.
///
/// Returns the number of attempts this worker settled. Lost claim races
/// are skipped silently; store errors on one event are logged and never
/// halt the rest of the batch.
async fn process_due_batch(
    store: &dyn EventStore,
    transport: &dyn Transport,
    clock: &dyn Clock,
    config: &OutboxConfig,
) -> usize {
    let due = match store.due_events(clock.now_ms(), config.batch_size).await {
        Ok(due) => due,
        Err(err) => {
            warn!(%err, "due-event query failed");
            return 0;
        }
    };

    let mut settled = 0;
    for event in due {
        match attempt_one(store, transport, clock, config, event.id).await {
            Ok(true) => settled += 1,
            Ok(false) => {} // lost the claim race
            Err(err) => warn!(id = event.id.0, %err, "attempt bookkeeping failed"),
        }
    }
    settled
}

/// Claim one event and drive a single delivery attempt to a recorded
/// outcome.
async fn attempt_one(
    store: &dyn EventStore,
    transport: &dyn Transport,
    clock: &dyn Clock,
    config: &OutboxConfig,
    id: EventId,
) -> Result<bool, StoreError> {
    let Some(claimed) = store.claim(id, clock.now_ms()).await? else {
        return Ok(false);
    };

    let result = match tokio::time::timeout(config.attempt_timeout, transport.deliver(&claimed))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(FailureReason::Timeout),
    };

    let now = clock.now_ms();
    match result {
        Ok(()) => {
            store.mark_delivered(id, now).await?;
            metric_inc("outbox.delivered");
            debug!(id = id.0, "delivered");
        }
        Err(reason) => {
            let attempt = claimed.retry_count + 1;
            let schedule = if attempt >= claimed.max_retries {
                None
            } else {
                Some(config.retry.next_retry_at(now, attempt))
            };
            let row = store
                .record_failure(id, &reason.to_string(), schedule, now)
                .await?;

            if row.status == DeliveryStatus::Failed {
                metric_inc("outbox.failed");
                warn!(id = id.0, retries = row.retry_count, %reason, "retry budget exhausted");
            } else {
                metric_inc("outbox.retry_scheduled");
                debug!(
                    id = id.0,
                    attempt,
                    next_retry_at = row.next_retry_at,
                    %reason,
                    "retry scheduled"
                );
            }
        }
    }
    Ok(true)
}
