// Cross-core shared-memory resource lock.
//
// The source primitive conflates two concerns: keeping the peer's memory
// domain powered while a caller touches shared memory, and gating access
// during outages. This type carries only those; mutual exclusion over the
// shared pointer words is the job of the per-channel ring/pool locks.
//
// Acquisition is refcounted: any number of holders may stack, and a holder
// may hand its reference to another call site (get passes its acquisition
// to the matching put/send).

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SblockError};

struct ResourceState {
    /// Cleared while the peer's memory domain is down.
    available: bool,
    /// Permanently down; acquire fails instead of waiting.
    dead: bool,
    holders: u32,
}

pub struct ResourceLock {
    state: Mutex<ResourceState>,
    cv: Condvar,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResourceState {
                available: true,
                dead: false,
                holders: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Block until the resource is available, then register a holder.
    /// Fails only when the fabric has been torn down for good.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.dead {
                return Err(SblockError::Reset);
            }
            if state.available {
                state.holders += 1;
                return Ok(());
            }
            self.cv.wait(&mut state);
        }
    }

    /// Drop one holder reference.
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.holders > 0, "resource released more than acquired");
        state.holders = state.holders.saturating_sub(1);
    }

    /// Gate new acquisitions (domain going down). Existing holders are
    /// unaffected; the domain stays up until they drain.
    pub fn suspend(&self) {
        self.state.lock().available = false;
    }

    /// Re-open the gate and wake blocked acquirers.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.available = true;
        self.cv.notify_all();
    }

    /// Permanent teardown; every blocked and future acquire fails.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.dead = true;
        self.cv.notify_all();
    }

    /// Current holder count, diagnostic only.
    pub fn holders(&self) -> u32 {
        self.state.lock().holders
    }
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}
