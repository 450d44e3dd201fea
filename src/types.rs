use std::fmt;

use serde::{Deserialize, Serialize};

/// Surrogate identity of a stored webhook event.
///
/// Assigned monotonically by the event store, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token identifying one logical notification.
///
/// At most one live (non-deleted) row may hold a given key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Generate a key for callers that do not supply one.
    pub fn generate(now_ms: u64) -> Self {
        Self(format!("whk_{}_{}", now_ms, fastrand::u32(..)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Weak reference to a row in the transaction ledger.
///
/// The ledger owns its lifecycle; the outbox only ever reads or clears
/// this reference, never cascades into it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Delivery lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Processing => "PROCESSING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DeliveryStatus::Pending),
            "PROCESSING" => Some(DeliveryStatus::Processing),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "FAILED" => Some(DeliveryStatus::Failed),
            "CANCELLED" => Some(DeliveryStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Soft-delete state, modeled as a sum type so "query excludes deleted"
/// is the default rather than a per-query convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Deleted,
}

impl Lifecycle {
    pub fn is_active(self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

/// One row of the event store: a recorded notification plus its retry
/// bookkeeping. All timestamps are Unix milliseconds.
///
/// Mutated only through `EventStore` transition methods; each transition
/// updates its side-effect fields and `updated_at` atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    pub idempotency_key: IdempotencyKey,
    pub event_type: String,

    /// Serialized notification body, opaque to the queue.
    pub payload: Vec<u8>,

    /// Cleared (never left dangling) when the referenced ledger row is removed.
    pub transaction_id: Option<TransactionId>,

    pub status: DeliveryStatus,

    /// Delivery attempts made so far. Never exceeds `max_retries`.
    pub retry_count: u32,

    /// Attempt budget, within 1..=10.
    pub max_retries: u32,

    /// Present iff the row is PENDING or FAILED with remaining budget.
    pub next_retry_at: Option<u64>,

    /// Set exactly once, on the PROCESSING -> DELIVERED transition.
    pub delivered_at: Option<u64>,

    /// Detail from the most recent failed attempt.
    pub last_error: Option<String>,

    pub created_at: u64,
    pub updated_at: u64,

    pub lifecycle: Lifecycle,
}

impl WebhookEvent {
    /// Remaining retry budget.
    pub fn retries_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Whether the row is due for a delivery attempt at `now_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.lifecycle.is_active()
            && matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
            && self.retry_count < self.max_retries
            && self.next_retry_at.is_some_and(|at| at <= now_ms)
    }
}

/// Admission request handed to the idempotency gate.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub idempotency_key: IdempotencyKey,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub transaction_id: Option<TransactionId>,
    pub max_retries: u32,
}

impl NewEvent {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    pub fn new(
        idempotency_key: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            idempotency_key: IdempotencyKey(idempotency_key.into()),
            event_type: event_type.into(),
            payload: payload.into(),
            transaction_id: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(TransactionId(transaction_id.into()));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Cancelled,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("DELETED"), None);
    }

    #[test]
    fn generated_keys_carry_prefix_and_differ() {
        let a = IdempotencyKey::generate(1_000);
        let b = IdempotencyKey::generate(1_000);
        assert!(a.as_str().starts_with("whk_"));
        assert_ne!(a, b);
    }

    #[test]
    fn due_requires_schedule_status_and_budget() {
        let mut event = WebhookEvent {
            id: EventId(1),
            idempotency_key: IdempotencyKey("whk_1".into()),
            event_type: "payment.captured".into(),
            payload: b"{}".to_vec(),
            transaction_id: None,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: Some(500),
            delivered_at: None,
            last_error: None,
            created_at: 100,
            updated_at: 100,
            lifecycle: Lifecycle::Active,
        };

        assert!(event.is_due(500));
        assert!(!event.is_due(499));

        event.status = DeliveryStatus::Processing;
        assert!(!event.is_due(500));

        event.status = DeliveryStatus::Failed;
        assert!(event.is_due(500));

        event.retry_count = 3;
        assert!(!event.is_due(500));

        event.retry_count = 0;
        event.lifecycle = Lifecycle::Deleted;
        assert!(!event.is_due(500));
    }
}
