use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::time::Timestamp;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-unique, monotonically increasing timer sequence.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

/// Opaque identifier for cancelling a timer.
///
/// Cancelling a one-shot timer whose callback already ran is a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: u64,
}

/// A scheduled callback with an absolute expiry on the monotonic clock.
pub(crate) struct TimerEntry {
    callback: Box<dyn FnMut() + Send>,
    expiry: Timestamp,
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl TimerEntry {
    pub(crate) fn new(
        sequence: u64,
        callback: impl FnMut() + Send + 'static,
        expiry: Timestamp,
        interval: Duration,
    ) -> Self {
        TimerEntry {
            callback: Box::new(callback),
            expiry,
            interval,
            repeat: !interval.is_zero(),
            sequence,
        }
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    pub(crate) fn expiry(&self) -> Timestamp {
        self.expiry
    }

    pub(crate) fn repeat(&self) -> bool {
        self.repeat
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Move a periodic timer's expiry one interval past `now`.
    pub(crate) fn restart(&mut self, now: Timestamp) {
        debug_assert!(self.repeat);
        self.expiry = now + self.interval;
    }
}
