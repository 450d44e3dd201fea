use std::time::Duration;

/// Retention rules for terminal events.
///
/// Sweeping soft-deletes; purging physically removes long-soft-deleted
/// rows and is an operator action, not part of the periodic loop.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Age past which terminal rows are soft-deleted.
    pub max_age: Duration,

    /// How long a soft-deleted row is kept before it may be purged.
    pub purge_after: Duration,

    /// PROCESSING rows older than this are reported as stalled.
    pub stall_threshold: Duration,

    /// Cadence of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            purge_after: Duration::from_secs(90 * 24 * 60 * 60),
            stall_threshold: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RetentionPolicy {
    /// Sweep cutoff for `now_ms`: rows with a basis timestamp before
    /// this are eligible for soft deletion.
    pub fn sweep_cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.max_age.as_millis() as u64)
    }

    pub fn purge_cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.purge_after.as_millis() as u64)
    }

    pub fn stall_cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stall_threshold.as_millis() as u64)
    }
}
