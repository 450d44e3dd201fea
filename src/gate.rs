//! Idempotency gate: the only way rows enter the event store.

use tracing::debug;

use crate::error::AdmitError;
use crate::store::{EventStore, InsertOutcome};
use crate::types::{NewEvent, WebhookEvent};

/// Outcome of admitting a notification.
#[derive(Debug, Clone)]
pub enum Admission {
    /// First sighting of the key; a PENDING row was created and is
    /// immediately eligible for delivery.
    Admitted(WebhookEvent),
    /// A live row already holds the key. It is returned unchanged,
    /// whatever its status; duplicates never re-trigger delivery.
    Duplicate(WebhookEvent),
}

impl Admission {
    pub fn event(&self) -> &WebhookEvent {
        match self {
            Admission::Admitted(e) | Admission::Duplicate(e) => e,
        }
    }
}

/// Validate and record a notification.
///
/// No delivery attempt happens synchronously from admission; the row is
/// scheduled with `next_retry_at = now` and picked up by the scheduler.
/// A uniqueness conflict from a concurrent double-admission is resolved
/// by re-reading the winning row.
pub async fn admit(
    store: &dyn EventStore,
    new: NewEvent,
    now_ms: u64,
) -> Result<Admission, AdmitError> {
    if new.idempotency_key.as_str().is_empty() {
        return Err(AdmitError::EmptyIdempotencyKey);
    }
    if new.event_type.is_empty() {
        return Err(AdmitError::EmptyEventType);
    }
    if new.payload.is_empty() {
        return Err(AdmitError::EmptyPayload);
    }
    if !(1..=10).contains(&new.max_retries) {
        return Err(AdmitError::MaxRetriesOutOfRange(new.max_retries));
    }

    let key = new.idempotency_key.clone();
    match store.insert(new, now_ms).await? {
        InsertOutcome::Inserted(event) => {
            debug!(id = event.id.0, key = key.as_str(), "event admitted");
            Ok(Admission::Admitted(event))
        }
        InsertOutcome::Conflict(existing) => {
            debug!(
                id = existing.id.0,
                key = key.as_str(),
                status = %existing.status,
                "duplicate notification coalesced"
            );
            Ok(Admission::Duplicate(existing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::DeliveryStatus;

    #[tokio::test]
    async fn first_sighting_creates_a_pending_row() {
        let store = InMemoryStore::new();
        let admission = admit(
            &store,
            NewEvent::new("whk_1", "payment.captured", b"{}".to_vec()),
            1_000,
        )
        .await
        .unwrap();

        let event = match admission {
            Admission::Admitted(e) => e,
            Admission::Duplicate(_) => panic!("fresh key reported as duplicate"),
        };
        assert_eq!(event.status, DeliveryStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.next_retry_at, Some(1_000));
        assert_eq!(event.created_at, 1_000);
        assert_eq!(event.updated_at, 1_000);
    }

    #[tokio::test]
    async fn repeat_sighting_returns_existing_row_unchanged() {
        let store = InMemoryStore::new();
        let first = admit(
            &store,
            NewEvent::new("whk_1", "payment.captured", b"{}".to_vec()),
            1_000,
        )
        .await
        .unwrap();

        // Different payload, same key: still coalesced.
        let second = admit(
            &store,
            NewEvent::new("whk_1", "payment.captured", b"{\"changed\":1}".to_vec()),
            2_000,
        )
        .await
        .unwrap();

        match second {
            Admission::Duplicate(existing) => assert_eq!(&existing, first.event()),
            Admission::Admitted(_) => panic!("duplicate key admitted twice"),
        }
    }

    #[tokio::test]
    async fn validation_rejects_before_persisting() {
        let store = InMemoryStore::new();

        let err = admit(&store, NewEvent::new("", "t", b"{}".to_vec()), 0)
            .await
            .unwrap_err();
        assert_eq!(err, AdmitError::EmptyIdempotencyKey);

        let err = admit(&store, NewEvent::new("whk_1", "", b"{}".to_vec()), 0)
            .await
            .unwrap_err();
        assert_eq!(err, AdmitError::EmptyEventType);

        let err = admit(&store, NewEvent::new("whk_1", "t", Vec::new()), 0)
            .await
            .unwrap_err();
        assert_eq!(err, AdmitError::EmptyPayload);

        let err = admit(
            &store,
            NewEvent::new("whk_1", "t", b"{}".to_vec()).with_max_retries(11),
            0,
        )
        .await
        .unwrap_err();
        assert_eq!(err, AdmitError::MaxRetriesOutOfRange(11));

        let err = admit(
            &store,
            NewEvent::new("whk_1", "t", b"{}".to_vec()).with_max_retries(0),
            0,
        )
        .await
        .unwrap_err();
        assert_eq!(err, AdmitError::MaxRetriesOutOfRange(0));

        // Nothing persisted.
        assert!(store
            .find_by_key(&crate::types::IdempotencyKey("whk_1".into()))
            .await
            .unwrap()
            .is_none());
    }
}
