//! The set of outer connections attached to one inner connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use super::inner::{ClosedInnerConnection, OpenInnerConnection};

/// What an inner connection needs from the handles attached to it.
pub trait OuterConnection: Send + Sync {
    fn id(&self) -> u64;

    /// Called while the tracker is locked. Returning false refuses the
    /// attachment (the handle was closed concurrently).
    fn set_open_inner_connection(&self, connection: Arc<OpenInnerConnection>) -> bool;

    /// The inner connection closed underneath this handle.
    fn set_closed_inner_connection(&self, connection: Arc<ClosedInnerConnection>);

    fn on_data_ready(&self);

    /// Forget the inner connection `connection_id` if it is still the one
    /// being connected; used when an attach raced with an abandoned request.
    fn reset_inner_connection(&self, connection_id: u64);

    fn is_closed(&self) -> bool;
}

/// Result of [`OuterConnectionTracker::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    NotAttached,
    Detached,
    /// The last handle left and the tracker closed itself.
    DetachedLast,
}

#[derive(Default)]
struct TrackerState {
    connections: HashMap<u64, Arc<dyn OuterConnection>>,
    closed: bool,
}

pub struct OuterConnectionTracker {
    state: Mutex<TrackerState>,
    close_on_empty: bool,
}

impl std::fmt::Debug for OuterConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OuterConnectionTracker")
            .field("attached", &state.connections.len())
            .field("closed", &state.closed)
            .field("close_on_empty", &self.close_on_empty)
            .finish()
    }
}

impl OuterConnectionTracker {
    pub fn new(close_on_empty: bool) -> Self {
        Self { state: Mutex::new(TrackerState::default()), close_on_empty }
    }

    /// Add `outer` unless the tracker is closed or `on_attached` refuses it.
    /// `on_attached` runs under the tracker lock, so a concurrent
    /// [`Self::close`] either sees the handle or the attach fails.
    pub fn attach<F>(&self, outer: Arc<dyn OuterConnection>, on_attached: F) -> bool
    where
        F: FnOnce(&Arc<dyn OuterConnection>) -> bool,
    {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.connections.contains_key(&outer.id()) {
            return true;
        }
        if !on_attached(&outer) {
            return false;
        }

        trace!(outer_id = outer.id(), attached = state.connections.len() + 1, "Outer connection attached");
        state.connections.insert(outer.id(), outer);
        true
    }

    pub fn detach(&self, outer_id: u64) -> Detached {
        let mut state = self.state.lock();
        if state.connections.remove(&outer_id).is_none() {
            return Detached::NotAttached;
        }

        trace!(outer_id, attached = state.connections.len(), "Outer connection detached");
        if state.connections.is_empty() && self.close_on_empty && !state.closed {
            state.closed = true;
            return Detached::DetachedLast;
        }
        Detached::Detached
    }

    /// Close the tracker and hand back everything still attached.
    pub fn close(&self) -> Vec<Arc<dyn OuterConnection>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.connections.drain().map(|(_, outer)| outer).collect()
    }

    pub fn connections(&self) -> Vec<Arc<dyn OuterConnection>> {
        self.state.lock().connections.values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
