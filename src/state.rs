//! Legal status transitions for webhook events.
//!
//! The table below is the whole contract; store implementations consult
//! it before applying any transition so that an illegal request can
//! never half-apply.

use crate::types::DeliveryStatus;

/// Whether `from -> to` is a legal transition.
///
/// - `Pending -> Processing` and `Failed -> Processing` are the claim
///   transitions; the conditional update that performs them is the only
///   synchronization primitive in the engine.
/// - `Processing -> Pending` schedules a retry, `Processing -> Failed`
///   records an exhausted budget, `Processing -> Delivered` is success.
/// - Cancellation is administrative and legal from `Pending` and
///   `Failed` only. `Delivered` and `Cancelled` accept nothing.
pub fn is_legal(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    use DeliveryStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Failed, Processing)
            | (Processing, Delivered)
            | (Processing, Pending)
            | (Processing, Failed)
            | (Pending, Cancelled)
            | (Failed, Cancelled)
    )
}

/// Terminal states: eligible for retention sweeps, never for delivery.
pub fn is_terminal(status: DeliveryStatus) -> bool {
    matches!(
        status,
        DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Cancelled
    )
}
