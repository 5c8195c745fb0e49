//! Pending-request accounting.
//!
//! Scopes increment a count on creation and decrement it when dropped, so the
//! counts stay balanced on early returns and panics.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Snapshot of the pending counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingRequests {
    /// Asynchronous requests waiting in the queue
    pub queued_async: usize,
    /// Synchronous requests currently executing an attempt
    pub executing: usize,
}

impl PendingRequests {
    pub fn any(&self) -> bool {
        self.queued_async > 0 || self.executing > 0
    }
}

#[derive(Debug, Default)]
pub struct PendingRequestCounter {
    counts: Mutex<PendingRequests>,
    changed: Condvar,
}

impl PendingRequestCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_scope(self: &Arc<Self>) -> RequestScope {
        self.counts.lock().executing += 1;
        RequestScope { counter: Arc::clone(self) }
    }

    pub fn create_async_scope(self: &Arc<Self>) -> AsyncRequestScope {
        self.counts.lock().queued_async += 1;
        AsyncRequestScope { counter: Arc::clone(self) }
    }

    pub fn has_pending_requests(&self) -> bool {
        self.counts.lock().any()
    }

    pub fn snapshot(&self) -> PendingRequests {
        *self.counts.lock()
    }

    /// Block until no synchronous request is executing.
    pub fn wait_for_no_executing(&self) {
        let mut counts = self.counts.lock();
        while counts.executing > 0 {
            self.changed.wait(&mut counts);
        }
    }

    fn release(&self, update: impl FnOnce(&mut PendingRequests)) {
        let mut counts = self.counts.lock();
        update(&mut counts);
        self.changed.notify_all();
    }
}

/// An executing synchronous attempt.
#[must_use]
#[derive(Debug)]
pub struct RequestScope {
    counter: Arc<PendingRequestCounter>,
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.counter.release(|counts| counts.executing -= 1);
    }
}

/// A queued asynchronous request.
#[must_use]
#[derive(Debug)]
pub struct AsyncRequestScope {
    counter: Arc<PendingRequestCounter>,
}

impl Drop for AsyncRequestScope {
    fn drop(&mut self) {
        self.counter.release(|counts| counts.queued_async -= 1);
    }
}
