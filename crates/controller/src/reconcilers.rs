use std::time::Duration;

use dashmap::DashMap;

pub mod health;
pub mod scheduling;
pub mod sync;

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Per-work-item retry bookkeeping: kube-runtime's error_policy gets no
/// attempt counter, so consecutive failures are tracked here to drive
/// exponential requeue delays.
#[derive(Default)]
pub struct Backoff {
    attempts: DashMap<String, u32>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next retry of `key`, doubling per consecutive
    /// failure up to the cap.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
        let exponent = (*entry).min(16);
        *entry += 1;
        BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(exponent))
    }

    /// Forget `key` after a successful reconcile.
    pub fn clear(&self, key: &str) {
        self.attempts.remove(key);
    }
}
