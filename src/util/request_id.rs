//! Connection ids for log correlation.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Tag attached to the tracing span of one client connection.
///
/// Ids count up from `conn-1` and are only unique within this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(u64);

impl RequestId {
    /// Take the next connection id.
    pub fn short() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
