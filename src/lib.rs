//! A persisted, idempotent webhook outbox.
//!
//! This crate provides a **durable, at-least-once** delivery queue for
//! webhook events: admit once, retry from persisted state, stop when
//! the budget runs out.
//!
//! ## Guarantees
//! - One live event per idempotency key
//! - At-least-once delivery while retries remain
//! - Bounded retry budget per event
//! - Crash recovery from the event store alone
//! - Audit history preserved across ledger deletions
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Global delivery ordering
//! - Distributed coordination
//!
//! Every scheduling decision is derived from the stored rows; there is
//! no in-memory queue to lose. The single synchronization primitive is
//! the claim, an atomic `PENDING|FAILED -> PROCESSING` update.

mod clock;
mod error;
mod gate;
mod ledger;
mod outbox;
mod retention;
mod retry;
mod signing;
mod state;
mod store;
mod transport;
mod types;

#[cfg(feature = "postgres")]
mod store_postgres;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmitError, FailureReason, StoreError, VerificationError};
pub use gate::{admit, Admission};
pub use ledger::{InMemoryLedger, LedgerView, Transaction};
pub use outbox::{Outbox, OutboxConfig};
pub use retention::RetentionPolicy;
pub use retry::RetryPolicy;
pub use signing::{compute_signature, verify_notification, verify_signature, SigningConfig};
pub use state::{is_legal, is_terminal};
pub use store::{CancelOutcome, EventStore, InMemoryStore, InsertOutcome};
pub use transport::{FlakyTransport, Transport};
pub use types::{
    DeliveryStatus, EventId, IdempotencyKey, Lifecycle, NewEvent, TransactionId, WebhookEvent,
};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
