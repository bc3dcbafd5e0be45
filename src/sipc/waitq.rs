// Wait queues for blocked producers/consumers.
//
// A waker updates shared state first, then calls wake_all; taking the queue
// mutex inside wake_all is what closes the check-then-sleep window for
// waiters that have not parked yet.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Caller-supplied wait policy, decoded from the millisecond timeout used
/// across the public API: `0` = poll, negative = forever, positive = bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    NoWait,
    Forever,
    Until(Instant),
}

impl Wait {
    pub fn from_ms(timeout_ms: i64) -> Self {
        if timeout_ms == 0 {
            Wait::NoWait
        } else if timeout_ms < 0 {
            Wait::Forever
        } else {
            Wait::Until(Instant::now() + Duration::from_millis(timeout_ms as u64))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// A condition-variable wait queue; the condition itself lives elsewhere
/// (shared-memory pointers, channel state) and is re-evaluated under the
/// queue lock on every wake-up.
pub struct WaitQueue {
    lock: Mutex<()>,
    cv: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Wake every parked waiter.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    /// Park until `ready()` holds or the deadline passes. `Wait::NoWait`
    /// callers must not reach this; they are handled before parking.
    pub fn wait_until(&self, wait: Wait, mut ready: impl FnMut() -> bool) -> WaitOutcome {
        let mut guard = self.lock.lock();
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            match wait {
                Wait::NoWait => return WaitOutcome::TimedOut,
                Wait::Forever => self.cv.wait(&mut guard),
                Wait::Until(deadline) => {
                    if self.cv.wait_until(&mut guard, deadline).timed_out() {
                        return if ready() {
                            WaitOutcome::Ready
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
