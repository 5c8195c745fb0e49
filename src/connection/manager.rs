//! The connection manager.
//!
//! One manager per simulator. It owns the current-connection slot, the
//! request queue and the acquisition worker, and hands out
//! [`SimulatorConnection`] handles that share whatever inner connection is
//! current.
//!
//! ```rust
//! use pitwall_connect::{ConnectionManager, ConnectionOptions, LocalSimulator, VariableType};
//! use std::time::Duration;
//!
//! let simulator = LocalSimulator::builder()
//!     .variable("Speed", VariableType::Float, 1, "m/s", "GPS vehicle speed")
//!     .build()?;
//! simulator.start();
//!
//! let manager = ConnectionManager::new(simulator.clone(), ConnectionOptions::default())?;
//! let connection = manager.connect(Some(Duration::from_secs(5)))?;
//! assert!(connection.variables()?.get("Speed").is_some());
//!
//! connection.close();
//! manager.dispose();
//! # Ok::<(), pitwall_connect::ConnectionError>(())
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::acquisition::AcquisitionWorker;
use super::deadline::Deadline;
use super::inner::{InnerConnectionOwner, OpenInnerConnection};
use super::objects::ConnectionObjectManager;
use super::outer::SimulatorConnection;
use super::requests::{ConnectionProvider, ConnectionRequestManager, PendingRequests};
use super::signals::ConnectionWaitResult;
use crate::config::ConnectionOptions;
use crate::memory::SimulatorSource;
use crate::{ConnectionError, Result};

/// Inner connection ids are unique across managers in the process.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ManagerShared {
    this: Weak<ManagerShared>,
    pub(super) options: ConnectionOptions,
    idle_timeout: Mutex<Duration>,
    pub(super) source: Arc<dyn SimulatorSource>,
    pub(super) objects: ConnectionObjectManager,
    pub(super) requests: ConnectionRequestManager,
    pub(super) acquisition: AcquisitionWorker,
    next_outer_id: AtomicU64,
}

impl ManagerShared {
    pub(super) fn idle_timeout(&self) -> Duration {
        *self.idle_timeout.lock()
    }

    pub(super) fn next_connection_id(&self) -> u64 {
        NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn next_outer_id(&self) -> u64 {
        self.next_outer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the acquisition worker for the caller that consumed the create
    /// signal. The signal is handed back if the thread cannot be spawned.
    fn start_acquisition(&self) -> Result<()> {
        let Some(this) = self.this.upgrade() else {
            self.objects.signal_create();
            return Err(ConnectionError::disposed("connection manager"));
        };

        self.acquisition.start(this).inspect_err(|_| self.objects.signal_create())
    }

    /// Take a signaled create token on behalf of pending requests and start
    /// the next acquisition. Queued async requests never wait on the signals
    /// themselves, and waiters that already handed their token to a worker
    /// wait without it.
    pub(super) fn restart_for_pending_requests(&self) -> bool {
        if !self.requests.has_pending_requests() || !self.objects.signals().try_consume_create() {
            return false;
        }

        debug!(pending = ?self.requests.pending_requests(), "Restarting acquisition for pending requests");
        if let Err(e) = self.start_acquisition() {
            warn!(error = %e, "Failed to restart acquisition");
        }
        true
    }
}

impl ConnectionProvider for ManagerShared {
    fn try_get_connection(&self, deadline: &Deadline, allow_create: bool) -> Result<Option<Arc<OpenInnerConnection>>> {
        let mut include_create = allow_create;

        loop {
            match self.objects.signals().wait(deadline, include_create) {
                None => return Ok(None),
                Some(ConnectionWaitResult::ConnectionAvailable) => {
                    if let Some(connection) = self.objects.connection() {
                        return Ok(Some(connection));
                    }
                    // Cleared between the wait and the read.
                    include_create = allow_create;
                    thread::yield_now();
                }
                Some(ConnectionWaitResult::ConnectionException) => {
                    if let Some(error) = self.objects.connection_exception() {
                        return Err(error);
                    }
                    thread::yield_now();
                }
                Some(ConnectionWaitResult::CreateConnection) => {
                    self.start_acquisition()?;
                    // The worker now holds the create token; wait for its result.
                    include_create = false;
                }
            }
        }
    }

    fn request_manager(&self) -> &ConnectionRequestManager {
        &self.requests
    }
}

impl InnerConnectionOwner for ManagerShared {
    fn on_connection_closing(&self, connection: &OpenInnerConnection) {
        if !self.objects.clear_connection(connection.id()) {
            return;
        }

        info!(connection_id = connection.id(), "Current simulator connection closing");
        self.objects.signal_create();
        self.restart_for_pending_requests();
    }
}

/// Entry point for connecting to one simulator. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("current", &self.shared.objects.connection().map(|connection| connection.id()))
            .field("pending", &self.shared.requests.pending_requests())
            .field("disposed", &self.shared.objects.is_disposed())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new<S: SimulatorSource>(source: S, options: ConnectionOptions) -> Result<Self> {
        Self::with_source(Arc::new(source), options)
    }

    pub fn with_source(source: Arc<dyn SimulatorSource>, options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        let idle_timeout = options.idle_timeout;

        let shared = Arc::new_cyclic(|this| ManagerShared {
            this: this.clone(),
            options,
            idle_timeout: Mutex::new(idle_timeout),
            source,
            objects: ConnectionObjectManager::new(),
            requests: ConnectionRequestManager::new(),
            acquisition: AcquisitionWorker::new(),
            next_outer_id: AtomicU64::new(1),
        });

        debug!(idle_timeout_ms = idle_timeout.as_millis() as u64, "Connection manager created");
        Ok(Self { shared })
    }

    /// Manager for the simulator running on this machine.
    #[cfg(windows)]
    pub fn windows(options: ConnectionOptions) -> Result<Self> {
        let source = crate::windows::WindowsSimulator::new(&options);
        Self::new(source, options)
    }

    /// A new, unopened connection handle.
    pub fn connection(&self) -> SimulatorConnection {
        SimulatorConnection::new(Arc::clone(&self.shared))
    }

    /// Create a handle and open it, blocking up to `timeout` (`None` waits
    /// forever).
    pub fn connect(&self, timeout: Option<Duration>) -> Result<SimulatorConnection> {
        let connection = self.connection();
        connection.open(timeout)?;
        Ok(connection)
    }

    /// Create a handle and open it without blocking the calling thread.
    pub async fn connect_async(
        &self,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<SimulatorConnection> {
        let connection = self.connection();
        connection.open_async(timeout, cancel).await?;
        Ok(connection)
    }

    /// Wait up to `timeout` for the current inner connection. With
    /// `allow_create` the caller may start acquisition. `Ok(None)` on timeout;
    /// a recorded connection exception is returned as the error.
    pub fn try_get_connection(
        &self,
        timeout: Option<Duration>,
        allow_create: bool,
    ) -> Result<Option<Arc<OpenInnerConnection>>> {
        let deadline = Deadline::after(timeout);
        self.shared.try_get_connection(&deadline, allow_create)
    }

    pub fn current_connection(&self) -> Option<Arc<OpenInnerConnection>> {
        self.shared.objects.connection()
    }

    pub fn pending_requests(&self) -> PendingRequests {
        self.shared.requests.pending_requests()
    }

    /// Number of acquisition workers started over the manager's lifetime.
    pub fn acquisition_workers_started(&self) -> u64 {
        self.shared.acquisition.started()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.idle_timeout()
    }

    /// Change the idle timeout for the current and future connections. The
    /// current worker thread picks it up on its next wait.
    pub fn set_idle_timeout(&self, idle_timeout: Duration) -> Result<()> {
        if idle_timeout.is_zero() {
            return Err(ConnectionError::configuration("idle_timeout must be positive"));
        }

        *self.shared.idle_timeout.lock() = idle_timeout;
        if let Some(connection) = self.shared.objects.connection() {
            connection.set_idle_timeout(idle_timeout);
        }
        debug!(idle_timeout_ms = idle_timeout.as_millis() as u64, "Idle timeout updated");
        Ok(())
    }

    /// Close the current connection and fail every current and future
    /// request with [`ConnectionError::Disposed`].
    pub fn dispose(&self) {
        if self.shared.objects.is_disposed() {
            return;
        }

        let current = self.shared.objects.dispose();
        self.shared.requests.fail_all(&ConnectionError::disposed("connection manager"));
        if let Some(connection) = current {
            connection.dispose();
        }
        info!("Connection manager disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.objects.is_disposed()
    }
}
