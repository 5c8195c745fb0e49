//! Data-ready signalling.
//!
//! The simulator pulses an auto-resetting event whenever a new data buffer
//! becomes active. [`DataReadySignal`] abstracts that event so the connection
//! worker can wait on the native Win32 object or on the in-process
//! [`AutoResetEvent`] used by [`LocalSimulator`](crate::memory::local::LocalSimulator).

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::Result;

/// Result of waiting for data updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    Timeout,
}

/// An auto-resetting signal pulsed by the simulator on every new data buffer.
pub trait DataReadySignal: Send + Sync {
    /// Block the calling thread until the signal fires or `timeout` elapses.
    /// A successful wait consumes the signal.
    fn wait(&self, timeout: Duration) -> Result<WaitResult>;
}

/// In-process auto-reset event.
///
/// `set` releases exactly one waiter (or the next caller of `wait` if nobody
/// is waiting); the event then resets itself.
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    signaled: Mutex<bool>,
    changed: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.changed.notify_one();
    }

    /// Whether the event is currently signaled (nobody consumed it yet).
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }
}

impl DataReadySignal for AutoResetEvent {
    fn wait(&self, timeout: Duration) -> Result<WaitResult> {
        let deadline = Instant::now().checked_add(timeout);
        let mut signaled = self.signaled.lock();

        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                        trace!(timeout_ms = timeout.as_millis() as u64, "Event wait timed out");
                        return Ok(WaitResult::Timeout);
                    }
                }
                None => self.changed.wait(&mut signaled),
            }
        }

        *signaled = false;
        Ok(WaitResult::Signaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait_is_not_lost() {
        let event = AutoResetEvent::new();
        event.set();
        assert_eq!(event.wait(Duration::from_millis(1)).unwrap(), WaitResult::Signaled);
        assert!(!event.is_set());
    }

    #[test]
    fn wait_resets_the_event() {
        let event = AutoResetEvent::new();
        event.set();
        event.set();
        assert_eq!(event.wait(Duration::ZERO).unwrap(), WaitResult::Signaled);
        assert_eq!(event.wait(Duration::from_millis(5)).unwrap(), WaitResult::Timeout);
    }

    #[test]
    fn set_wakes_a_blocked_waiter() {
        let event = Arc::new(AutoResetEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(Duration::from_secs(5)).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        event.set();
        assert_eq!(waiter.join().unwrap(), WaitResult::Signaled);
    }
}
