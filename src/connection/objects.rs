//! The current-connection slot.
//!
//! Holds either the current open inner connection or the current connection
//! exception, and mirrors both into [`ConnectionSignals`]. The slot is locked
//! before the signals whenever both change together.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::inner::OpenInnerConnection;
use super::signals::ConnectionSignals;
use crate::ConnectionError;

#[derive(Default)]
struct Slot {
    connection: Option<Arc<OpenInnerConnection>>,
    exception: Option<ConnectionError>,
    disposed: bool,
}

#[derive(Default)]
pub struct ConnectionObjectManager {
    slot: Mutex<Slot>,
    signals: ConnectionSignals,
}

impl ConnectionObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> &ConnectionSignals {
        &self.signals
    }

    /// Publish `connection` as current and clear any recorded exception.
    /// Refused after disposal.
    pub fn set_connection(&self, connection: Arc<OpenInnerConnection>) -> bool {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return false;
        }
        debug!(connection_id = connection.id(), "Publishing connection");
        slot.connection = Some(connection);
        slot.exception = None;
        self.signals.clear_exception();
        self.signals.set_available();
        true
    }

    pub fn connection(&self) -> Option<Arc<OpenInnerConnection>> {
        self.slot.lock().connection.clone()
    }

    /// Clear the slot if it still holds `connection_id`.
    pub fn clear_connection(&self, connection_id: u64) -> bool {
        let mut slot = self.slot.lock();
        match &slot.connection {
            Some(current) if current.id() == connection_id => {
                slot.connection = None;
                self.signals.clear_available();
                debug!(connection_id, "Cleared current connection");
                true
            }
            _ => false,
        }
    }

    pub fn take_connection(&self) -> Option<Arc<OpenInnerConnection>> {
        let mut slot = self.slot.lock();
        self.signals.clear_available();
        slot.connection.take()
    }

    pub fn set_connection_exception(&self, error: ConnectionError) {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return;
        }
        slot.exception = Some(error);
        self.signals.set_exception();
    }

    pub fn clear_connection_exception(&self) {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return;
        }
        slot.exception = None;
        self.signals.clear_exception();
    }

    pub fn connection_exception(&self) -> Option<ConnectionError> {
        self.slot.lock().exception.clone()
    }

    pub fn signal_create(&self) {
        self.signals.signal_create();
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.lock().disposed
    }

    /// Record a permanent `Disposed` exception so every current and future
    /// waiter fails, and hand back the connection that was current.
    pub fn dispose(&self) -> Option<Arc<OpenInnerConnection>> {
        let mut slot = self.slot.lock();
        if slot.disposed {
            return None;
        }
        slot.disposed = true;
        slot.exception = Some(ConnectionError::disposed("connection manager"));
        let connection = slot.connection.take();
        self.signals.clear_available();
        self.signals.set_exception();
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::deadline::Deadline;
    use crate::connection::inner::InnerConnectionOwner;
    use crate::connection::signals::ConnectionWaitResult;
    use crate::data::variables::VariableType;
    use crate::memory::SimulatorSource;
    use crate::memory::local::LocalSimulator;
    use std::sync::Weak;
    use std::time::Duration;

    struct NoOwner;

    impl InnerConnectionOwner for NoOwner {
        fn on_connection_closing(&self, _connection: &OpenInnerConnection) {}
    }

    fn connection(id: u64) -> Arc<OpenInnerConnection> {
        let simulator = LocalSimulator::builder().variable("Gear", VariableType::Int, 1, "", "").build().unwrap();
        simulator.start();
        let attachment = simulator.try_attach(Duration::ZERO).unwrap().unwrap();
        let owner: Weak<dyn InnerConnectionOwner> = Weak::<NoOwner>::new();
        OpenInnerConnection::new(id, attachment, Duration::from_secs(5), true, owner)
    }

    #[test]
    fn set_then_get_returns_the_same_connection() {
        let objects = ConnectionObjectManager::new();
        let published = connection(1);

        assert!(objects.set_connection(Arc::clone(&published)));
        let current = objects.connection().unwrap();
        assert!(Arc::ptr_eq(&current, &published));
        assert_eq!(
            objects.signals().wait(&Deadline::immediate(), false),
            Some(ConnectionWaitResult::ConnectionAvailable)
        );

        assert!(!objects.clear_connection(2), "stale ids do not clear");
        assert!(objects.clear_connection(1));
        assert!(objects.connection().is_none());
        assert_eq!(objects.signals().wait(&Deadline::immediate(), false), None);
    }

    #[test]
    fn publishing_clears_a_recorded_exception() {
        let objects = ConnectionObjectManager::new();
        objects.set_connection_exception(ConnectionError::connection_failed("boom"));
        assert!(objects.connection_exception().is_some());

        objects.set_connection(connection(1));
        assert!(objects.connection_exception().is_none());
    }

    #[test]
    fn dispose_is_permanent() {
        let objects = ConnectionObjectManager::new();
        objects.set_connection(connection(1));

        assert!(objects.dispose().is_some());
        assert!(objects.dispose().is_none());
        assert!(!objects.set_connection(connection(2)));

        objects.clear_connection_exception();
        assert!(matches!(objects.connection_exception(), Some(ConnectionError::Disposed { .. })));
        assert_eq!(
            objects.signals().wait(&Deadline::immediate(), true),
            Some(ConnectionWaitResult::ConnectionException)
        );
    }
}
