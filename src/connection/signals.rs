//! Coordination signals.
//!
//! [`ConnectionRequestSignals`] are the two gates closed during a quiescence
//! window. [`ConnectionSignals`] are the three conditions a connection
//! request waits on: a connection is available, a connection exception is
//! recorded, or somebody has to create the connection.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use tracing::trace;

use super::deadline::Deadline;

/// A gate that stays closed while at least one closer holds it.
#[derive(Debug, Default)]
struct Gate {
    closers: Mutex<usize>,
    opened: Condvar,
}

impl Gate {
    fn close(&self) {
        *self.closers.lock() += 1;
    }

    fn open(&self) {
        let mut closers = self.closers.lock();
        *closers = closers.saturating_sub(1);
        if *closers == 0 {
            self.opened.notify_all();
        }
    }

    fn is_open(&self) -> bool {
        *self.closers.lock() == 0
    }

    fn wait(&self) {
        let mut closers = self.closers.lock();
        while *closers > 0 {
            self.opened.wait(&mut closers);
        }
    }
}

/// Gates for "allow async request creation" and "allow request execution".
/// Both start open.
#[derive(Debug, Default)]
pub struct ConnectionRequestSignals {
    async_creation: Gate,
    execution: Gate,
}

impl ConnectionRequestSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close both gates until the returned guard drops.
    pub fn block(&self) -> RequestBlock<'_> {
        self.async_creation.close();
        self.execution.close();
        trace!("Request gates closed");
        RequestBlock { signals: self }
    }

    pub fn wait_for_async_request_creation(&self) {
        self.async_creation.wait();
    }

    pub fn wait_for_request_execution(&self) {
        self.execution.wait();
    }

    pub fn is_blocked(&self) -> bool {
        !self.async_creation.is_open() || !self.execution.is_open()
    }
}

/// Reopens both request gates on drop, including during unwinding.
#[must_use = "the gates reopen as soon as the block is dropped"]
pub struct RequestBlock<'a> {
    signals: &'a ConnectionRequestSignals,
}

impl Drop for RequestBlock<'_> {
    fn drop(&mut self) {
        self.signals.execution.open();
        self.signals.async_creation.open();
        trace!("Request gates reopened");
    }
}

/// Outcome of a composite wait. The discriminants are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionWaitResult {
    ConnectionAvailable = 0,
    ConnectionException = 1,
    CreateConnection = 2,
}

impl ConnectionWaitResult {
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct SignalState {
    available: bool,
    exception: bool,
    create: bool,
}

/// Available and exception persist until cleared; create is consumed by the
/// single waiter that observes it.
#[derive(Debug)]
pub struct ConnectionSignals {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl Default for ConnectionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSignals {
    /// Nothing available and no exception; the first caller must create.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState { available: false, exception: false, create: true }),
            changed: Condvar::new(),
        }
    }

    /// Wait until one condition holds or `deadline` passes. Conditions are
    /// checked in index order, so an available connection wins over a stale
    /// exception and both win over create. `None` on timeout; a zero
    /// remaining time still checks once.
    pub fn wait(&self, deadline: &Deadline, include_create: bool) -> Option<ConnectionWaitResult> {
        let mut state = self.state.lock();
        loop {
            if state.available {
                return Some(ConnectionWaitResult::ConnectionAvailable);
            }
            if state.exception {
                return Some(ConnectionWaitResult::ConnectionException);
            }
            if include_create && state.create {
                state.create = false;
                return Some(ConnectionWaitResult::CreateConnection);
            }

            match deadline.instant() {
                Some(at) => {
                    if Instant::now() >= at {
                        return None;
                    }
                    self.changed.wait_until(&mut state, at);
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    pub fn set_available(&self) {
        self.state.lock().available = true;
        self.changed.notify_all();
    }

    pub fn clear_available(&self) {
        self.state.lock().available = false;
    }

    pub fn set_exception(&self) {
        self.state.lock().exception = true;
        self.changed.notify_all();
    }

    pub fn clear_exception(&self) {
        self.state.lock().exception = false;
    }

    pub fn signal_create(&self) {
        self.state.lock().create = true;
        self.changed.notify_all();
    }

    /// Consume the create signal without waiting.
    pub fn try_consume_create(&self) -> bool {
        std::mem::take(&mut self.state.lock().create)
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    pub fn is_create_signaled(&self) -> bool {
        self.state.lock().create
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn result_indices_are_stable() {
        assert_eq!(ConnectionWaitResult::ConnectionAvailable.index(), 0);
        assert_eq!(ConnectionWaitResult::ConnectionException.index(), 1);
        assert_eq!(ConnectionWaitResult::CreateConnection.index(), 2);
    }

    #[test]
    fn create_is_consumed_by_one_waiter() {
        let signals = ConnectionSignals::new();
        let deadline = Deadline::immediate();

        assert_eq!(signals.wait(&deadline, true), Some(ConnectionWaitResult::CreateConnection));
        assert_eq!(signals.wait(&deadline, true), None);

        signals.signal_create();
        assert!(signals.try_consume_create());
        assert!(!signals.try_consume_create());
    }

    #[test]
    fn waits_without_create_ignore_it() {
        let signals = ConnectionSignals::new();
        assert_eq!(signals.wait(&Deadline::immediate(), false), None);
        assert!(signals.is_create_signaled());
    }

    #[test]
    fn available_beats_exception_beats_create() {
        let signals = ConnectionSignals::new();
        signals.set_exception();
        assert_eq!(
            signals.wait(&Deadline::immediate(), true),
            Some(ConnectionWaitResult::ConnectionException)
        );

        signals.set_available();
        assert_eq!(
            signals.wait(&Deadline::immediate(), true),
            Some(ConnectionWaitResult::ConnectionAvailable)
        );
        // Persistent conditions are not consumed.
        assert!(signals.is_available());
        assert!(signals.is_create_signaled());
    }

    #[test]
    fn waiters_wake_when_a_condition_is_set() {
        let signals = Arc::new(ConnectionSignals::new());
        assert!(signals.try_consume_create());

        let waiter = {
            let signals = Arc::clone(&signals);
            thread::spawn(move || signals.wait(&Deadline::after(Some(Duration::from_secs(5))), true))
        };

        thread::sleep(Duration::from_millis(20));
        signals.set_available();
        assert_eq!(waiter.join().unwrap(), Some(ConnectionWaitResult::ConnectionAvailable));
    }

    #[test]
    fn request_gates_reopen_on_drop() {
        let signals = Arc::new(ConnectionRequestSignals::new());
        let passed = Arc::new(AtomicBool::new(false));

        let block = signals.block();
        assert!(signals.is_blocked());

        let waiter = {
            let signals = Arc::clone(&signals);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                signals.wait_for_request_execution();
                signals.wait_for_async_request_creation();
                passed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!passed.load(Ordering::SeqCst));

        drop(block);
        waiter.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
        assert!(!signals.is_blocked());
    }

    #[test]
    fn nested_blocks_keep_gates_closed() {
        let signals = ConnectionRequestSignals::new();
        let outer = signals.block();
        {
            let _inner = signals.block();
        }
        assert!(signals.is_blocked());
        drop(outer);
        assert!(!signals.is_blocked());
    }
}
