//! Cooperative cancellation for pipeline runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared flag observed at every channel suspension point and by the
/// supervisor's poll loop.
///
/// Cancelling unblocks stages waiting on a full or empty channel, so an
/// external stop request cannot be wedged behind backpressure.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
