//! In-flight request counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of requests currently being forwarded to one backend.
///
/// All mutation goes through atomic read-modify-write operations, so
/// concurrent increments and decrements never lose updates. The counter
/// never goes below zero.
#[derive(Debug, Default)]
pub struct LoadCounter {
    value: AtomicU64,
}

impl LoadCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::with_value(0)
    }

    /// Create a counter starting at `value`.
    pub fn with_value(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Add one in-flight request.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove one in-flight request. Saturates at zero.
    pub fn decrement(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    /// Current number of in-flight requests.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
