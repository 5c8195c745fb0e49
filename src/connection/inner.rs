//! The physical attachment shared by outer connections.
//!
//! An [`OpenInnerConnection`] owns the live region, the data-ready signal, the
//! tracker of attached handles and the worker thread. Closing it is one-way:
//! the live region is replaced by a [`ClosedInnerConnection`] holding a
//! snapshot, which every still-attached handle receives so in-flight readers
//! keep working against the last-known data.

use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::tracker::{Detached, OuterConnection, OuterConnectionTracker};
use super::worker::{ConnectionWorkerThread, WorkerThreadOwner};
use crate::memory::{MemorySnapshot, SharedRegion, SimulatorAttachment};
use crate::signal::{DataReadySignal, WaitResult};
use crate::{ConnectionError, Result};

/// Receives the one-time closing notification of an inner connection.
pub trait InnerConnectionOwner: Send + Sync {
    fn on_connection_closing(&self, connection: &OpenInnerConnection);
}

pub struct OpenInnerConnection {
    id: u64,
    this: Weak<OpenInnerConnection>,
    memory: RwLock<Option<Arc<dyn SharedRegion>>>,
    data_ready: Arc<dyn DataReadySignal>,
    idle_timeout: Mutex<Duration>,
    tracker: OuterConnectionTracker,
    worker: Mutex<Option<ConnectionWorkerThread>>,
    closed: OnceLock<Arc<ClosedInnerConnection>>,
    closing: AtomicBool,
    owner: Weak<dyn InnerConnectionOwner>,
}

impl std::fmt::Debug for OpenInnerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenInnerConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl OpenInnerConnection {
    pub(crate) fn new(
        id: u64,
        attachment: SimulatorAttachment,
        idle_timeout: Duration,
        close_on_empty: bool,
        owner: Weak<dyn InnerConnectionOwner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            memory: RwLock::new(Some(attachment.memory)),
            data_ready: attachment.data_ready,
            idle_timeout: Mutex::new(idle_timeout),
            tracker: OuterConnectionTracker::new(close_on_empty),
            worker: Mutex::new(None),
            closed: OnceLock::new(),
            closing: AtomicBool::new(false),
            owner,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of attached outer connections.
    pub fn attached(&self) -> usize {
        self.tracker.len()
    }

    /// The live region, or the closing snapshot once closed.
    pub fn region(&self) -> Result<Arc<dyn SharedRegion>> {
        if let Some(memory) = self.memory.read().as_ref() {
            return Ok(Arc::clone(memory));
        }
        self.closed
            .get()
            .map(|closed| closed.region())
            .ok_or_else(|| ConnectionError::disposed("inner connection"))
    }

    pub fn closed_connection(&self) -> Option<Arc<ClosedInnerConnection>> {
        self.closed.get().cloned()
    }

    pub fn idle_timeout(&self) -> Duration {
        *self.idle_timeout.lock()
    }

    pub(crate) fn set_idle_timeout(&self, idle_timeout: Duration) {
        *self.idle_timeout.lock() = idle_timeout;
    }

    /// Register `outer` and hand it this connection. Fails once closing has
    /// started.
    pub(crate) fn attach(&self, outer: Arc<dyn OuterConnection>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };

        let attached = self.tracker.attach(outer, |outer| outer.set_open_inner_connection(Arc::clone(&this)));
        if attached {
            debug!(connection_id = self.id, attached = self.tracker.len(), "Attached outer connection");
        }
        attached
    }

    /// Remove `outer_id`; closes this connection when it was the last handle
    /// and the tracker closes on empty. Returns whether the handle was attached.
    pub(crate) fn detach(&self, outer_id: u64) -> bool {
        match self.tracker.detach(outer_id) {
            Detached::NotAttached => false,
            Detached::Detached => true,
            Detached::DetachedLast => {
                debug!(connection_id = self.id, "Last outer connection detached");
                self.close();
                true
            }
        }
    }

    pub(crate) fn start_worker_thread(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if self.is_closed() || worker.is_some() {
            return Ok(());
        }

        let owner: Weak<dyn WorkerThreadOwner> = self.this.clone();
        *worker = Some(ConnectionWorkerThread::spawn(format!("pitwall-connection-{}", self.id), owner)?);
        debug!(connection_id = self.id, "Started connection worker thread");
        Ok(())
    }

    /// Transition to closed. Only the first call does anything and returns true.
    pub fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        let outers = self.tracker.close();

        if let Some(owner) = self.owner.upgrade() {
            owner.on_connection_closing(self);
        }

        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }

        let snapshot = match self.memory.read().as_ref() {
            Some(memory) => MemorySnapshot::capture(memory.as_ref()).unwrap_or_else(|e| {
                warn!(connection_id = self.id, error = %e, "Failed to snapshot region on close");
                MemorySnapshot::empty()
            }),
            None => MemorySnapshot::empty(),
        };
        let closed = Arc::new(ClosedInnerConnection { id: self.id, snapshot: Arc::new(snapshot) });
        let _ = self.closed.set(Arc::clone(&closed));
        self.memory.write().take();

        info!(connection_id = self.id, outers = outers.len(), "Inner connection closed");

        for outer in outers {
            let outer_id = outer.id();
            let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                outer.set_closed_inner_connection(Arc::clone(&closed));
            }));
            if notified.is_err() {
                error!(connection_id = self.id, outer_id, "Outer connection panicked during close notification");
            }
        }

        true
    }

    /// Close regardless of attached handles.
    pub fn dispose(&self) {
        if self.close() {
            debug!(connection_id = self.id, "Inner connection disposed");
        }
    }

    #[cfg(test)]
    pub(crate) fn join_worker_thread(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.join();
        }
    }
}

impl WorkerThreadOwner for OpenInnerConnection {
    fn idle_timeout(&self) -> Duration {
        OpenInnerConnection::idle_timeout(self)
    }

    fn wait_for_data(&self, timeout: Duration) -> Result<WaitResult> {
        self.data_ready.wait(timeout)
    }

    fn on_data_ready(&self) {
        for outer in self.tracker.connections() {
            outer.on_data_ready();
        }
    }

    fn on_worker_thread_exit(&self, canceled: bool) {
        if canceled {
            debug!(connection_id = self.id, "Connection worker thread canceled");
        } else {
            info!(connection_id = self.id, "Simulator went idle, closing connection");
            self.close();
        }
    }
}

/// Terminal state of an inner connection: a retained snapshot for late readers.
#[derive(Debug)]
pub struct ClosedInnerConnection {
    id: u64,
    snapshot: Arc<MemorySnapshot>,
}

impl ClosedInnerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn region(&self) -> Arc<dyn SharedRegion> {
        self.snapshot.clone()
    }
}

/// The inner connection an outer handle currently refers to.
#[derive(Debug, Clone)]
pub enum InnerConnection {
    Open(Arc<OpenInnerConnection>),
    Closed(Arc<ClosedInnerConnection>),
}

impl InnerConnection {
    pub fn id(&self) -> u64 {
        match self {
            InnerConnection::Open(connection) => connection.id(),
            InnerConnection::Closed(connection) => connection.id(),
        }
    }

    pub fn region(&self) -> Result<Arc<dyn SharedRegion>> {
        match self {
            InnerConnection::Open(connection) => connection.region(),
            InnerConnection::Closed(connection) => Ok(connection.region()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::local::LocalSimulator;
    use crate::memory::SimulatorSource;
    use crate::data::variables::VariableType;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingOwner {
        closing: AtomicUsize,
    }

    impl InnerConnectionOwner for CountingOwner {
        fn on_connection_closing(&self, _connection: &OpenInnerConnection) {
            self.closing.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingOuter {
        id: u64,
        closed: Mutex<Option<Arc<ClosedInnerConnection>>>,
        panic_on_close: bool,
    }

    impl RecordingOuter {
        fn new(id: u64, panic_on_close: bool) -> Arc<Self> {
            Arc::new(Self { id, closed: Mutex::new(None), panic_on_close })
        }
    }

    impl OuterConnection for RecordingOuter {
        fn id(&self) -> u64 {
            self.id
        }
        fn set_open_inner_connection(&self, _connection: Arc<OpenInnerConnection>) -> bool {
            true
        }
        fn set_closed_inner_connection(&self, connection: Arc<ClosedInnerConnection>) {
            if self.panic_on_close {
                panic!("outer {} refuses to close", self.id);
            }
            *self.closed.lock() = Some(connection);
        }
        fn on_data_ready(&self) {}
        fn reset_inner_connection(&self, _connection_id: u64) {}
        fn is_closed(&self) -> bool {
            false
        }
    }

    fn open(owner: &Arc<CountingOwner>, close_on_empty: bool) -> Arc<OpenInnerConnection> {
        let simulator = LocalSimulator::builder()
            .variable("Speed", VariableType::Float, 1, "m/s", "")
            .build()
            .unwrap();
        simulator.start();
        let attachment = simulator.try_attach(Duration::ZERO).unwrap().unwrap();
        let weak: Weak<dyn InnerConnectionOwner> = Arc::downgrade(owner) as Weak<dyn InnerConnectionOwner>;
        OpenInnerConnection::new(7, attachment, Duration::from_secs(5), close_on_empty, weak)
    }

    #[test]
    fn last_detach_closes_once() {
        let owner = Arc::new(CountingOwner::default());
        let connection = open(&owner, true);
        let a = RecordingOuter::new(1, false);
        let b = RecordingOuter::new(2, false);

        assert!(connection.attach(a.clone()));
        assert!(connection.attach(b.clone()));
        assert!(connection.detach(1));
        assert!(!connection.is_closed());
        assert!(!connection.detach(1), "second detach is a no-op");

        assert!(connection.detach(2));
        assert!(connection.is_closed());
        assert!(!connection.close(), "closing twice is a no-op");
        assert_eq!(owner.closing.load(Ordering::SeqCst), 1);
        assert!(!connection.attach(RecordingOuter::new(3, false)));
    }

    #[test]
    fn close_hands_attached_handles_a_snapshot() {
        let owner = Arc::new(CountingOwner::default());
        let connection = open(&owner, true);
        let outer = RecordingOuter::new(1, false);
        connection.attach(outer.clone());

        let live_len = connection.region().unwrap().len();
        assert!(connection.close());

        let closed = outer.closed.lock().clone().expect("outer notified");
        assert_eq!(closed.id(), 7);
        assert_eq!(closed.region().len(), live_len);
        assert_eq!(connection.region().unwrap().len(), live_len);
    }

    #[test]
    fn dispose_notifies_everyone_despite_a_panicking_handle() {
        let owner = Arc::new(CountingOwner::default());
        let connection = open(&owner, true);
        let bad = RecordingOuter::new(1, true);
        let good = RecordingOuter::new(2, false);
        connection.attach(bad.clone());
        connection.attach(good.clone());

        connection.dispose();

        assert!(good.closed.lock().is_some());
        assert_eq!(owner.closing.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keep_open_connections_survive_an_empty_tracker() {
        let owner = Arc::new(CountingOwner::default());
        let connection = open(&owner, false);
        let outer = RecordingOuter::new(1, false);
        connection.attach(outer.clone());
        connection.detach(1);
        assert!(!connection.is_closed());
        assert_eq!(owner.closing.load(Ordering::SeqCst), 0);
    }
}
