//! The caller-facing connection handle.
//!
//! A [`SimulatorConnection`] moves through `None -> Connecting -> Open ->
//! Closed`. A failed open returns it to `None`; `Closed` is terminal. Many
//! handles share one inner connection. When that inner connection closes
//! underneath a handle, the handle is closed too but keeps serving reads from
//! the snapshot taken at close.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::deadline::Deadline;
use super::inner::{ClosedInnerConnection, InnerConnection, OpenInnerConnection};
use super::manager::ManagerShared;
use super::requests::ConnectionRequest;
use super::tracker::OuterConnection;
use crate::data::{BufferSnapshot, DataFileHeader, SessionInfoText, VariableTable, read_latest_buffer_into};
use crate::memory::SharedRegion;
use crate::{ConnectionError, Result};

/// Lifecycle state of a [`SimulatorConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    None,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::None => "not open",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A logical connection to the simulator.
///
/// Dropping the handle closes it.
pub struct SimulatorConnection {
    core: Arc<OuterCore>,
}

impl fmt::Debug for SimulatorConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorConnection")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

impl SimulatorConnection {
    pub(crate) fn new(manager: Arc<ManagerShared>) -> Self {
        let id = manager.next_outer_id();
        Self {
            core: Arc::new(OuterCore {
                id,
                manager,
                state: Mutex::new(OuterState { phase: ConnectionState::None, inner: None }),
                admission: AtomicBool::new(false),
                notifier: DataReadyNotifier::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state.lock().phase
    }

    /// Id of the inner connection this handle refers to, open or closed.
    pub fn connection_id(&self) -> Option<u64> {
        self.core.state.lock().inner.as_ref().map(InnerConnection::id)
    }

    /// Attach to the current inner connection, creating it if needed, and
    /// block up to `timeout` (`None` waits forever).
    pub fn open(&self, timeout: Option<Duration>) -> Result<()> {
        let admission = self.core.admit()?;
        let outer: Arc<dyn OuterConnection> = self.core.clone();

        let connection = ConnectionRequest::new(outer, Deadline::after(timeout)).execute(&*self.core.manager)?;

        admission.commit();
        info!(outer_id = self.core.id, connection_id = connection.id(), "Simulator connection opened");
        Ok(())
    }

    /// Non-blocking variant of [`open`](Self::open). Canceling `cancel`
    /// fails the open with [`ConnectionError::Canceled`] and leaves the
    /// handle reusable.
    pub async fn open_async(&self, timeout: Option<Duration>, cancel: CancellationToken) -> Result<()> {
        let admission = self.core.admit()?;
        let outer: Arc<dyn OuterConnection> = self.core.clone();
        let manager = &self.core.manager;

        let connection_id = manager.requests.submit(&**manager, outer, Deadline::after(timeout), cancel).await?;

        admission.commit();
        info!(outer_id = self.core.id, connection_id, "Simulator connection opened");
        Ok(())
    }

    /// Detach from the inner connection. Idempotent; the last handle to
    /// detach closes the inner connection.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    fn region(&self, operation: &'static str) -> Result<Arc<dyn SharedRegion>> {
        let state = self.core.state.lock();
        match &state.inner {
            Some(inner) => inner.region(),
            None => Err(ConnectionError::invalid_state(operation, state.phase)),
        }
    }

    pub fn header(&self) -> Result<DataFileHeader> {
        DataFileHeader::read(self.region("read header")?.as_ref())
    }

    pub fn session_info(&self) -> Result<SessionInfoText> {
        SessionInfoText::read(self.region("read session info")?.as_ref())
    }

    pub fn variables(&self) -> Result<VariableTable> {
        let region = self.region("read variables")?;
        let header = DataFileHeader::read_validated(region.as_ref())?;
        VariableTable::read(region.as_ref(), &header)
    }

    /// Copy the latest data buffer into `dst` with a consistent read.
    pub fn read_latest_buffer(&self, dst: &mut Vec<u8>) -> Result<BufferSnapshot> {
        read_latest_buffer_into(self.region("read data buffer")?.as_ref(), dst)
    }

    /// Block until the simulator publishes new data or `timeout` elapses.
    /// Returns false on timeout or when the connection closes meanwhile.
    pub fn wait_for_data_ready(&self, timeout: Duration) -> Result<bool> {
        self.require_open("wait for data")?;
        Ok(self.core.notifier.wait(timeout))
    }

    pub async fn wait_for_data_ready_async(&self, timeout: Duration) -> Result<bool> {
        self.require_open("wait for data")?;
        let Some(mut updates) = self.core.notifier.subscribe() else {
            return Ok(false);
        };

        match tokio::time::timeout(timeout, updates.changed()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    /// Stream of data-ready sequence numbers, starting with the next pulse.
    /// Ends when the connection closes.
    pub fn data_ready_updates(&self) -> WatchStream<u64> {
        match self.core.notifier.subscribe() {
            Some(receiver) => WatchStream::from_changes(receiver),
            None => {
                let (_, receiver) = watch::channel(0);
                WatchStream::from_changes(receiver)
            }
        }
    }

    fn require_open(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            other => Err(ConnectionError::invalid_state(operation, other)),
        }
    }
}

impl Drop for SimulatorConnection {
    fn drop(&mut self) {
        self.core.close();
    }
}

struct OuterState {
    phase: ConnectionState,
    inner: Option<InnerConnection>,
}

struct OuterCore {
    id: u64,
    manager: Arc<ManagerShared>,
    state: Mutex<OuterState>,
    /// Set while an open is in flight.
    admission: AtomicBool,
    notifier: DataReadyNotifier,
}

impl OuterCore {
    fn admit(&self) -> Result<Admission<'_>> {
        if self.admission.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::invalid_state("open", ConnectionState::Connecting));
        }

        let mut state = self.state.lock();
        if state.phase != ConnectionState::None {
            let phase = state.phase;
            drop(state);
            self.admission.store(false, Ordering::Release);
            return Err(ConnectionError::invalid_state("open", phase));
        }

        state.phase = ConnectionState::Connecting;
        Ok(Admission { core: self, committed: false })
    }

    fn close(&self) -> bool {
        let inner = {
            let mut state = self.state.lock();
            if state.phase == ConnectionState::Closed {
                return false;
            }
            state.phase = ConnectionState::Closed;
            state.inner.take()
        };

        if let Some(InnerConnection::Open(connection)) = inner {
            connection.detach(self.id);
        }
        self.notifier.close();
        debug!(outer_id = self.id, "Simulator connection closed");
        true
    }
}

impl OuterConnection for OuterCore {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_open_inner_connection(&self, connection: Arc<OpenInnerConnection>) -> bool {
        let mut state = self.state.lock();
        if state.phase == ConnectionState::Closed {
            return false;
        }
        state.inner = Some(InnerConnection::Open(connection));
        true
    }

    fn set_closed_inner_connection(&self, connection: Arc<ClosedInnerConnection>) {
        {
            let mut state = self.state.lock();
            state.inner = Some(InnerConnection::Closed(connection));
            state.phase = ConnectionState::Closed;
        }
        self.notifier.close();
        debug!(outer_id = self.id, "Inner connection closed under handle");
    }

    fn on_data_ready(&self) {
        self.notifier.notify();
    }

    fn reset_inner_connection(&self, connection_id: u64) {
        let mut state = self.state.lock();
        let attached_to = match &state.inner {
            Some(InnerConnection::Open(connection)) => Some(connection.id()),
            _ => None,
        };
        if state.phase != ConnectionState::Open && attached_to == Some(connection_id) {
            state.inner = None;
            trace!(outer_id = self.id, connection_id, "Reset inner connection");
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().phase == ConnectionState::Closed
    }
}

/// Single in-flight open per handle. Without a commit the handle returns to
/// `None` on drop.
struct Admission<'a> {
    core: &'a OuterCore,
    committed: bool,
}

impl Admission<'_> {
    fn commit(mut self) {
        let mut state = self.core.state.lock();
        if state.phase == ConnectionState::Connecting {
            state.phase = ConnectionState::Open;
        }
        self.committed = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut state = self.core.state.lock();
            if state.phase == ConnectionState::Connecting {
                state.phase = ConnectionState::None;
            }
        }
        self.core.admission.store(false, Ordering::Release);
    }
}

struct NotifierState {
    sequence: u64,
    closed: bool,
}

/// Fans data-ready pulses out to blocking and async waiters.
struct DataReadyNotifier {
    state: Mutex<NotifierState>,
    changed: Condvar,
    updates: Mutex<Option<watch::Sender<u64>>>,
}

impl DataReadyNotifier {
    fn new() -> Self {
        let (sender, _) = watch::channel(0);
        Self {
            state: Mutex::new(NotifierState { sequence: 0, closed: false }),
            changed: Condvar::new(),
            updates: Mutex::new(Some(sender)),
        }
    }

    fn notify(&self) {
        let sequence = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.sequence += 1;
            state.sequence
        };
        self.changed.notify_all();

        if let Some(sender) = self.updates.lock().as_ref() {
            sender.send_replace(sequence);
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let start = state.sequence;

        while state.sequence == start && !state.closed {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        state.sequence != start
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        self.updates.lock().as_ref().map(watch::Sender::subscribe)
    }

    /// Wake every waiter and end every stream.
    fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
        self.updates.lock().take();
    }
}
