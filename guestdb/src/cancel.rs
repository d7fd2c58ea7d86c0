//! Cancellation signal shared between a connection and its callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancels guest calls on one connection.
///
/// Clones share the same flag, so a clone handed to another thread can stop a
/// call that is blocked inside the guest. A running call notices the flag at
/// the next epoch tick; a call started after cancellation fails before it
/// enters the guest. Either way the connection is abandoned afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called on any
    /// clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
