//! Non-blocking connection requests and their future.

use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::{self, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

use super::ConnectionProvider;
use super::counter::AsyncRequestScope;
use crate::connection::deadline::Deadline;
use crate::connection::inner::OpenInnerConnection;
use crate::connection::tracker::OuterConnection;
use crate::{ConnectionError, Result};

type Outcome = Result<Arc<OpenInnerConnection>>;

/// How a completion was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// The future was dropped before the result arrived.
    Abandoned,
    AlreadyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryComplete {
    Completed,
    Pending,
}

/// A queued acquisition attempt completed by whichever thread next sees a
/// connection, an exception or the deadline.
pub struct AsyncConnectionRequest {
    outer: Arc<dyn OuterConnection>,
    deadline: Deadline,
    completion: Mutex<Option<oneshot::Sender<Outcome>>>,
    scope: Mutex<Option<AsyncRequestScope>>,
}

impl std::fmt::Debug for AsyncConnectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnectionRequest")
            .field("outer_id", &self.outer.id())
            .field("deadline", &self.deadline)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl AsyncConnectionRequest {
    pub fn new(
        outer: Arc<dyn OuterConnection>,
        deadline: Deadline,
        scope: AsyncRequestScope,
    ) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (sender, receiver) = oneshot::channel();
        let request = Arc::new(Self {
            outer,
            deadline,
            completion: Mutex::new(Some(sender)),
            scope: Mutex::new(Some(scope)),
        });
        (request, receiver)
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Deliver `outcome` once. An attach whose future is already gone is undone.
    pub fn complete(&self, outcome: Outcome) -> Completion {
        let Some(sender) = self.completion.lock().take() else {
            return Completion::AlreadyCompleted;
        };
        drop(self.scope.lock().take());

        match sender.send(outcome) {
            Ok(()) => Completion::Delivered,
            Err(undelivered) => {
                if let Ok(connection) = undelivered {
                    release_attachment(&self.outer, &connection);
                }
                trace!(outer_id = self.outer.id(), "Connection request abandoned");
                Completion::Abandoned
            }
        }
    }

    /// Complete as canceled; a no-op if a result was already delivered.
    pub fn cancel(&self) -> Completion {
        self.complete(Err(ConnectionError::Canceled))
    }

    /// Complete with a timeout; a no-op if a result was already delivered.
    pub fn expire(&self) -> Completion {
        self.complete(Err(ConnectionError::Timeout { duration: self.deadline.budget() }))
    }

    /// Complete with a timeout if the deadline has passed.
    pub fn expire_if_due(&self) -> bool {
        if self.is_completed() {
            return true;
        }
        if self.deadline.is_expired() {
            self.expire();
            return true;
        }
        false
    }

    /// One non-blocking attempt against the provider.
    pub fn try_complete(&self, provider: &dyn ConnectionProvider, allow_create: bool) -> TryComplete {
        if self.is_completed() {
            return TryComplete::Completed;
        }

        if self.outer.is_closed() {
            self.complete(Err(ConnectionError::disposed("connection")));
            return TryComplete::Completed;
        }

        match provider.try_get_connection(&Deadline::immediate(), allow_create) {
            Ok(Some(connection)) => {
                if connection.attach(Arc::clone(&self.outer)) {
                    debug!(
                        outer_id = self.outer.id(),
                        connection_id = connection.id(),
                        "Async connection request attached"
                    );
                    self.complete(Ok(connection));
                    return TryComplete::Completed;
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.complete(Err(e));
                return TryComplete::Completed;
            }
        }

        if self.expire_if_due() { TryComplete::Completed } else { TryComplete::Pending }
    }
}

fn release_attachment(outer: &Arc<dyn OuterConnection>, connection: &Arc<OpenInnerConnection>) {
    debug!(outer_id = outer.id(), connection_id = connection.id(), "Undoing attach of abandoned request");
    outer.reset_inner_connection(connection.id());
    connection.detach(outer.id());
}

pin_project! {
    /// Resolves to the id of the connection the outer handle was attached to.
    ///
    /// Canceling the token completes the request with
    /// [`ConnectionError::Canceled`]. The future enforces the request
    /// deadline with its own timer, so it times out even when no
    /// acquisition worker is running. Dropping the future abandons the
    /// request; an attach that raced with the drop is undone.
    ///
    /// Must be polled inside a Tokio runtime with the time driver enabled.
    pub struct ConnectFuture {
        #[pin]
        cancelled: WaitForCancellationFutureOwned,
        #[pin]
        expiry: Option<Sleep>,
        receiver: oneshot::Receiver<Outcome>,
        request: Arc<AsyncConnectionRequest>,
        finished: bool,
    }

    impl PinnedDrop for ConnectFuture {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if *this.finished {
                return;
            }
            this.request.cancel();
            if let Ok(Ok(connection)) = this.receiver.try_recv() {
                release_attachment(&this.request.outer, &connection);
            }
        }
    }
}

impl ConnectFuture {
    pub(crate) fn new(
        request: Arc<AsyncConnectionRequest>,
        receiver: oneshot::Receiver<Outcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self { cancelled: cancel.cancelled_owned(), expiry: None, receiver, request, finished: false }
    }
}

impl Future for ConnectFuture {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(Err(ConnectionError::invalid_state("poll", "completed")));
        }

        if this.cancelled.poll(cx).is_ready() {
            // No-op when the result is already in the channel.
            this.request.cancel();
        }

        // Armed on first poll so the future can be built outside a runtime.
        if this.expiry.is_none() {
            if let Some(at) = this.request.deadline().instant() {
                this.expiry.set(Some(time::sleep_until(time::Instant::from_std(at))));
            }
        }
        if let Some(expiry) = this.expiry.as_mut().as_pin_mut() {
            if expiry.poll(cx).is_ready() {
                this.request.expire();
            }
        }

        match Pin::new(this.receiver).poll(cx) {
            Poll::Ready(outcome) => {
                *this.finished = true;
                let outcome = outcome.unwrap_or_else(|_| Err(ConnectionError::disposed("connection request")));
                Poll::Ready(outcome.map(|connection| connection.id()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
