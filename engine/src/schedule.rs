//! Debounce timers.
//!
//! Timers are plain deadlines: the engine never sleeps or reads a clock. The
//! caller passes `now` in and the runtime driving the engine decides when to
//! poll, using [`Debounce::deadline`] to know how long it may sleep.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Default window coalescing storage mutations into one notification.
pub const DEFAULT_NOTIFY_DELAY_MS: u64 = 10;

/// Default window coalescing notifications into one drain-and-dispatch cycle.
pub const DEFAULT_FLUSH_DELAY_MS: u64 = 2_000;

/// A cancel-and-reschedule timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debounce {
    window: u64,
    deadline: Option<Timestamp>,
}

impl Debounce {
    /// Create an idle timer with the given window in milliseconds.
    pub fn new(window: u64) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Window length in milliseconds.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// (Re)arm the timer: any pending deadline is replaced.
    pub fn schedule(&mut self, now: Timestamp) {
        self.deadline = Some(now.saturating_add(self.window));
    }

    /// Disarm the timer.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Whether the timer is armed.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the timer fires, if armed.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Fire the timer if it is due. Returns true exactly once per arming.
    pub fn fire(&mut self, now: Timestamp) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Debounce windows of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    /// Milliseconds a burst of mutations is coalesced before notifying
    pub notify_delay: u64,
    /// Milliseconds notifications are coalesced before draining the diff
    pub flush_delay: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            notify_delay: DEFAULT_NOTIFY_DELAY_MS,
            flush_delay: DEFAULT_FLUSH_DELAY_MS,
        }
    }
}

/// The two-stage timer pair driving a collection.
///
/// Stage one coalesces mutations into one notification and arms stage two;
/// stage two coalesces notifications into one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTimers {
    pub notify: Debounce,
    pub flush: Debounce,
}

impl DispatchTimers {
    /// Create idle timers.
    pub fn new(timings: Timings) -> Self {
        Self {
            notify: Debounce::new(timings.notify_delay),
            flush: Debounce::new(timings.flush_delay),
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        earliest(self.notify.deadline(), self.flush.deadline())
    }
}

/// Earliest of two optional deadlines.
pub fn earliest(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
