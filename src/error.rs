use thiserror::Error;

use crate::types::{DeliveryStatus, EventId};

/// Errors rejected synchronously at admission, before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,

    #[error("event type must not be empty")]
    EmptyEventType,

    #[error("payload must not be empty")]
    EmptyPayload,

    /// `max_retries` outside the schema bound.
    #[error("max_retries must be within 1..=10, got {0}")]
    MaxRetriesOutOfRange(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the event store.
///
/// A lost claim race is *not* an error; `EventStore::claim` reports it
/// as `Ok(None)`. `IllegalTransition` indicates a programming error in
/// the caller, never a retryable condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("event {0} not found")]
    NotFound(EventId),

    #[error("illegal transition {from} -> {to} for event {id}")]
    IllegalTransition {
        id: EventId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// Backend failure (connection lost, query failed).
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Reasons why a single delivery attempt failed.
///
/// These are absorbed into row state (`last_error`, retry bookkeeping)
/// and never propagate past the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// Remote endpoint answered with a 5xx-class response.
    #[error("remote endpoint returned error status {0}")]
    RemoteError(u16),

    /// Remote endpoint answered with a 4xx-class response.
    #[error("remote endpoint rejected request with status {0}")]
    ClientError(u16),

    /// Transport-specific failure with no finer classification.
    #[error("{0}")]
    Other(String),
}

/// Errors from inbound signature verification, checked before admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("missing timestamp header")]
    MissingTimestamp,

    #[error("timestamp is not a valid integer")]
    InvalidTimestamp,

    #[error("timestamp outside freshness window")]
    StaleTimestamp,

    #[error("signature mismatch")]
    InvalidSignature,
}
