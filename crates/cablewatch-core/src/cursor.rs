//! Caller-owned resume marker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Highest message id observed by a stream.
///
/// Cloning yields another handle to the same value, so the caller can keep
/// one handle for persistence while the stream advances another. Zero means
/// nothing has been observed yet.
#[derive(Clone, Debug, Default)]
pub struct LastSeenCursor {
    value: Arc<AtomicU64>,
}

impl LastSeenCursor {
    /// Start from a previously persisted position.
    pub fn new(initial: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(initial)),
        }
    }

    /// Current position.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Move forward to `message_id` if it is higher than the current position.
    ///
    /// Returns `true` if the cursor moved.
    pub fn advance(&self, message_id: u64) -> bool {
        self.value.fetch_max(message_id, Ordering::AcqRel) < message_id
    }
}
