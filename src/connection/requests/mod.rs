//! Connection request management.
//!
//! Synchronous requests run on the caller's thread inside an execution scope.
//! Asynchronous requests try once on submission and otherwise wait in a
//! queue that the acquisition worker drains after it publishes a connection
//! (or records an exception). Both kinds are counted so the worker knows when
//! nobody is waiting any more.

mod async_request;
mod counter;
mod sync_request;

pub use async_request::{AsyncConnectionRequest, Completion, ConnectFuture, TryComplete};
pub use counter::{AsyncRequestScope, PendingRequestCounter, PendingRequests, RequestScope};
pub use sync_request::ConnectionRequest;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::deadline::Deadline;
use super::inner::OpenInnerConnection;
use super::signals::{ConnectionRequestSignals, RequestBlock};
use super::tracker::OuterConnection;
use crate::{ConnectionError, Result};

/// Source of the current connection for requests.
pub trait ConnectionProvider: Send + Sync {
    /// Wait until `deadline` for a connection. `Err` carries the recorded
    /// connection exception; `Ok(None)` means the deadline passed.
    fn try_get_connection(
        &self,
        deadline: &Deadline,
        allow_create: bool,
    ) -> Result<Option<Arc<OpenInnerConnection>>>;

    fn request_manager(&self) -> &ConnectionRequestManager;
}

#[derive(Debug)]
pub struct ConnectionRequestManager {
    counter: Arc<PendingRequestCounter>,
    signals: ConnectionRequestSignals,
    queue: Mutex<Vec<Arc<AsyncConnectionRequest>>>,
}

impl Default for ConnectionRequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRequestManager {
    pub fn new() -> Self {
        Self {
            counter: PendingRequestCounter::new(),
            signals: ConnectionRequestSignals::new(),
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Enter an execution scope, waiting while execution is blocked.
    pub fn create_scope(&self) -> RequestScope {
        self.signals.wait_for_request_execution();
        self.counter.create_scope()
    }

    /// Create an async request, try it once and queue it if still pending.
    pub fn submit(
        &self,
        provider: &dyn ConnectionProvider,
        outer: Arc<dyn OuterConnection>,
        deadline: Deadline,
        cancel: CancellationToken,
    ) -> ConnectFuture {
        self.signals.wait_for_async_request_creation();

        let scope = self.counter.create_async_scope();
        let (request, receiver) = AsyncConnectionRequest::new(outer, deadline, scope);
        let future = ConnectFuture::new(Arc::clone(&request), receiver, cancel.clone());

        if cancel.is_cancelled() {
            request.cancel();
            return future;
        }

        // Held across the attempt so a concurrent drain either runs first
        // (and this attempt sees its connection) or sees this request.
        let mut queue = self.queue.lock();
        if request.try_complete(provider, true) == TryComplete::Pending {
            // Requests completed by their own future stay queued until the
            // next drain.
            queue.retain(|queued| !queued.is_completed());
            queue.push(request);
            debug!(queued = queue.len(), "Queued async connection request");
        }
        future
    }

    /// Try every queued request against the current state, dropping the ones
    /// that completed.
    pub fn process_async_request_queue(&self, provider: &dyn ConnectionProvider, is_new_connection: bool) {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|request| request.try_complete(provider, false) == TryComplete::Pending);
        debug!(completed = before - queue.len(), remaining = queue.len(), is_new_connection, "Processed async request queue");
    }

    /// Fail queued requests whose deadline passed.
    pub fn expire_async_requests(&self) {
        self.queue.lock().retain(|request| !request.expire_if_due());
    }

    /// Earliest deadline among queued requests.
    pub fn next_async_deadline(&self) -> Option<Instant> {
        self.queue.lock().iter().filter_map(|request| request.deadline().instant()).min()
    }

    pub fn block_requests(&self) -> RequestBlock<'_> {
        self.signals.block()
    }

    /// Inside a quiescence window: if nothing is pending, run `on_abort`
    /// while requests are still blocked and report true.
    pub fn try_abort(&self, on_abort: impl FnOnce()) -> bool {
        let _block = self.signals.block();
        if self.counter.has_pending_requests() {
            return false;
        }
        on_abort();
        true
    }

    pub fn wait_for_executing_requests(&self) {
        self.counter.wait_for_no_executing();
    }

    pub fn has_pending_requests(&self) -> bool {
        self.counter.has_pending_requests()
    }

    pub fn pending_requests(&self) -> PendingRequests {
        self.counter.snapshot()
    }

    /// Complete every queued request with `error`.
    pub fn fail_all(&self, error: &ConnectionError) {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for request in drained {
            request.complete(Err(error.clone()));
        }
    }
}
