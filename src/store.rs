use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::state;
use crate::types::{
    DeliveryStatus, EventId, IdempotencyKey, Lifecycle, NewEvent, TransactionId, WebhookEvent,
};

/// Result of an insert attempt against the unique idempotency key.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(WebhookEvent),
    /// A live row already holds this key; the existing row is returned
    /// unchanged. Concurrent double-admission lands here too.
    Conflict(WebhookEvent),
}

/// Result of an administrative cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Already cancelled; cancelling again is a no-op.
    AlreadyCancelled,
    /// The row is PROCESSING; retry once the in-flight attempt settles.
    InFlight,
}

/// Durable store of webhook events.
///
/// This is the single shared mutable resource; all worker coordination
/// goes through it. `claim` must be a single atomic conditional update:
/// a caller that gets `Ok(None)` has lost the race and must not touch
/// the event.
///
/// Transition methods apply the status change and its side-effect
/// fields (`retry_count`, `next_retry_at`, `delivered_at`, `last_error`,
/// `updated_at`) together; partial application is never observable.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new PENDING row, or report the live row already holding
    /// the idempotency key. Input validation happens at the gate.
    async fn insert(&self, new: NewEvent, now_ms: u64) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError>;

    /// Look up the live row for a key. Deleted rows do not count.
    async fn find_by_key(&self, key: &IdempotencyKey)
        -> Result<Option<WebhookEvent>, StoreError>;

    /// Events eligible for a delivery attempt: live, PENDING or FAILED,
    /// due at `now_ms`, with budget left. Ordered by `next_retry_at`
    /// then `created_at` so the oldest-due run first.
    async fn due_events(&self, now_ms: u64, limit: usize)
        -> Result<Vec<WebhookEvent>, StoreError>;

    /// The claim: `PENDING|FAILED -> PROCESSING` as one conditional
    /// update. `Ok(None)` means another worker got there first (or the
    /// row advanced); never an error.
    async fn claim(&self, id: EventId, now_ms: u64) -> Result<Option<WebhookEvent>, StoreError>;

    /// `PROCESSING -> DELIVERED`; sets `delivered_at`, clears
    /// `next_retry_at`.
    async fn mark_delivered(&self, id: EventId, now_ms: u64) -> Result<WebhookEvent, StoreError>;

    /// Record a failed attempt on a PROCESSING row: increments
    /// `retry_count` and either reschedules (`next_retry_at` given,
    /// `-> PENDING`) or terminates (`-> FAILED`, schedule cleared).
    async fn record_failure(
        &self,
        id: EventId,
        error: &str,
        next_retry_at: Option<u64>,
        now_ms: u64,
    ) -> Result<WebhookEvent, StoreError>;

    /// Administrative cancel. Legal from PENDING and FAILED, idempotent
    /// on CANCELLED, `InFlight` for PROCESSING, an illegal-transition
    /// error for DELIVERED.
    async fn cancel(&self, id: EventId, now_ms: u64) -> Result<CancelOutcome, StoreError>;

    /// Reset the budget of up to `limit` live FAILED rows and make them
    /// due immediately. Returns how many were redriven.
    async fn redrive_failed(&self, limit: usize, now_ms: u64) -> Result<u64, StoreError>;

    /// Clear the ledger reference on every row pointing at `tx`. The
    /// rows themselves, their status, and their history stay intact.
    async fn clear_transaction_refs(
        &self,
        tx: &TransactionId,
        now_ms: u64,
    ) -> Result<u64, StoreError>;

    /// Distinct ledger references currently held by live rows.
    async fn referenced_transactions(&self) -> Result<Vec<TransactionId>, StoreError>;

    /// Soft-delete live terminal rows whose basis timestamp
    /// (`delivered_at` for DELIVERED, `updated_at` otherwise) predates
    /// `cutoff_ms`. PENDING/PROCESSING rows are never touched.
    async fn sweep(&self, cutoff_ms: u64, now_ms: u64) -> Result<u64, StoreError>;

    /// Physically remove soft-deleted rows whose `updated_at` predates
    /// `cutoff_ms`. Operator-triggered, out of the hot path.
    async fn purge(&self, cutoff_ms: u64) -> Result<u64, StoreError>;

    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn list_by_transaction(
        &self,
        tx: &TransactionId,
        include_deleted: bool,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn list_by_event_type(
        &self,
        event_type: &str,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn count_by_status(&self, status: DeliveryStatus) -> Result<u64, StoreError>;

    /// Live PROCESSING rows whose `updated_at` predates `older_than_ms`.
    /// A stall is a liveness bug to alert on, not to delete.
    async fn stalled_processing(&self, older_than_ms: u64)
        -> Result<Vec<WebhookEvent>, StoreError>;
}

/// In-memory store for tests and lightweight deployments.
///
/// A single mutex over the row map makes every trait method atomic,
/// which is exactly the conditional-update guarantee the claim needs.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<i64, WebhookEvent>,
    next_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn live_by_key(&self, key: &IdempotencyKey) -> Option<&WebhookEvent> {
        self.rows
            .values()
            .find(|e| e.lifecycle.is_active() && &e.idempotency_key == key)
    }

    fn row_mut(&mut self, id: EventId) -> Result<&mut WebhookEvent, StoreError> {
        self.rows.get_mut(&id.0).ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert(&self, new: NewEvent, now_ms: u64) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.live_by_key(&new.idempotency_key) {
            return Ok(InsertOutcome::Conflict(existing.clone()));
        }

        inner.next_id += 1;
        let event = WebhookEvent {
            id: EventId(inner.next_id),
            idempotency_key: new.idempotency_key,
            event_type: new.event_type,
            payload: new.payload,
            transaction_id: new.transaction_id,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            next_retry_at: Some(now_ms),
            delivered_at: None,
            last_error: None,
            created_at: now_ms,
            updated_at: now_ms,
            lifecycle: Lifecycle::Active,
        };
        inner.rows.insert(event.id.0, event.clone());
        Ok(InsertOutcome::Inserted(event))
    }

    async fn get(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(&id.0).cloned())
    }

    async fn find_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.live_by_key(key).cloned())
    }

    async fn due_events(
        &self,
        now_ms: u64,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<WebhookEvent> = inner
            .rows
            .values()
            .filter(|e| e.is_due(now_ms))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_retry_at, e.created_at, e.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: EventId, now_ms: u64) -> Result<Option<WebhookEvent>, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;

        let claimable = row.lifecycle.is_active()
            && matches!(row.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
            && row.retry_count < row.max_retries;
        if !claimable {
            return Ok(None);
        }

        row.status = DeliveryStatus::Processing;
        row.next_retry_at = None;
        row.updated_at = now_ms;
        Ok(Some(row.clone()))
    }

    async fn mark_delivered(&self, id: EventId, now_ms: u64) -> Result<WebhookEvent, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;

        if !state::is_legal(row.status, DeliveryStatus::Delivered) {
            return Err(StoreError::IllegalTransition {
                id,
                from: row.status,
                to: DeliveryStatus::Delivered,
            });
        }

        row.status = DeliveryStatus::Delivered;
        row.delivered_at = Some(now_ms);
        row.next_retry_at = None;
        row.updated_at = now_ms;
        Ok(row.clone())
    }

    async fn record_failure(
        &self,
        id: EventId,
        error: &str,
        next_retry_at: Option<u64>,
        now_ms: u64,
    ) -> Result<WebhookEvent, StoreError> {
        let to = if next_retry_at.is_some() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::Failed
        };

        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;

        if !state::is_legal(row.status, to) {
            return Err(StoreError::IllegalTransition {
                id,
                from: row.status,
                to,
            });
        }

        row.status = to;
        row.retry_count += 1;
        row.next_retry_at = next_retry_at;
        row.last_error = Some(error.to_string());
        row.updated_at = now_ms;
        Ok(row.clone())
    }

    async fn cancel(&self, id: EventId, now_ms: u64) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;

        match row.status {
            DeliveryStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            DeliveryStatus::Processing => Ok(CancelOutcome::InFlight),
            DeliveryStatus::Pending | DeliveryStatus::Failed => {
                row.status = DeliveryStatus::Cancelled;
                row.next_retry_at = None;
                row.updated_at = now_ms;
                Ok(CancelOutcome::Cancelled)
            }
            from @ DeliveryStatus::Delivered => Err(StoreError::IllegalTransition {
                id,
                from,
                to: DeliveryStatus::Cancelled,
            }),
        }
    }

    async fn redrive_failed(&self, limit: usize, now_ms: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut keyed: Vec<(u64, i64)> = inner
            .rows
            .values()
            .filter(|e| e.lifecycle.is_active() && e.status == DeliveryStatus::Failed)
            .map(|e| (e.created_at, e.id.0))
            .collect();
        keyed.sort_unstable();
        let ids: Vec<i64> = keyed.into_iter().take(limit).map(|(_, id)| id).collect();

        for id in &ids {
            if let Some(row) = inner.rows.get_mut(id) {
                row.retry_count = 0;
                row.next_retry_at = Some(now_ms);
                row.updated_at = now_ms;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn clear_transaction_refs(
        &self,
        tx: &TransactionId,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut cleared = 0;
        for row in inner.rows.values_mut() {
            if row.transaction_id.as_ref() == Some(tx) {
                row.transaction_id = None;
                row.updated_at = now_ms;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn referenced_transactions(&self) -> Result<Vec<TransactionId>, StoreError> {
        let inner = self.inner.lock().await;
        let mut refs: Vec<TransactionId> = inner
            .rows
            .values()
            .filter(|e| e.lifecycle.is_active())
            .filter_map(|e| e.transaction_id.clone())
            .collect();
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        refs.dedup();
        Ok(refs)
    }

    async fn sweep(&self, cutoff_ms: u64, now_ms: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut swept = 0;
        for row in inner.rows.values_mut() {
            if !row.lifecycle.is_active() || !state::is_terminal(row.status) {
                continue;
            }
            let basis = match row.status {
                DeliveryStatus::Delivered => row.delivered_at.unwrap_or(row.updated_at),
                _ => row.updated_at,
            };
            if basis < cutoff_ms {
                row.lifecycle = Lifecycle::Deleted;
                row.updated_at = now_ms;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn purge(&self, cutoff_ms: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner
            .rows
            .retain(|_, e| e.lifecycle.is_active() || e.updated_at >= cutoff_ms);
        Ok((before - inner.rows.len()) as u64)
    }

    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<WebhookEvent> = inner
            .rows
            .values()
            .filter(|e| e.status == status && (include_deleted || e.lifecycle.is_active()))
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.created_at, e.id));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_by_transaction(
        &self,
        tx: &TransactionId,
        include_deleted: bool,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<WebhookEvent> = inner
            .rows
            .values()
            .filter(|e| {
                e.transaction_id.as_ref() == Some(tx)
                    && (include_deleted || e.lifecycle.is_active())
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| std::cmp::Reverse((e.created_at, e.id)));
        Ok(out)
    }

    async fn list_by_event_type(
        &self,
        event_type: &str,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<WebhookEvent> = inner
            .rows
            .values()
            .filter(|e| {
                e.event_type == event_type && (include_deleted || e.lifecycle.is_active())
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| std::cmp::Reverse((e.created_at, e.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn count_by_status(&self, status: DeliveryStatus) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .filter(|e| e.lifecycle.is_active() && e.status == status)
            .count() as u64)
    }

    async fn stalled_processing(
        &self,
        older_than_ms: u64,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<WebhookEvent> = inner
            .rows
            .values()
            .filter(|e| {
                e.lifecycle.is_active()
                    && e.status == DeliveryStatus::Processing
                    && e.updated_at < older_than_ms
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.updated_at, e.id));
        Ok(out)
    }
}
