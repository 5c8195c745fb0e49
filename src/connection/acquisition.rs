//! The background task that creates inner connections.
//!
//! At most one acquisition worker runs at a time. It is started by whichever
//! caller consumes the create signal, polls the simulator source while
//! requests are pending and ends in one of three ways:
//!
//! - **Published**: the new connection is set as current, the async queue is
//!   drained against it and only then is its worker thread started.
//! - **Failed**: the error is recorded as the connection exception inside a
//!   quiescence window, every waiter observes it, and create is re-signaled.
//! - **Aborted**: nobody is waiting any more; create is re-signaled for the
//!   next caller.
//!
//! A connection that closes between being set as current and being handed
//! the create token passes the token straight back to the running worker,
//! which then acquires again instead of exiting.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::inner::{InnerConnectionOwner, OpenInnerConnection};
use super::manager::ManagerShared;
use crate::memory::SimulatorAttachment;
use crate::{ConnectionError, Result};

/// Lower bound of a single source wait, so an already-due request deadline
/// does not turn the loop into a busy spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// How an acquisition run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    Published { connection_id: u64 },
    Failed,
    Aborted,
    Disposed,
}

#[derive(Debug, Default)]
struct WorkerState {
    running: bool,
    /// The create token was handed to the running worker again because the
    /// connection it was publishing closed before the hand-over.
    rerun: bool,
}

#[derive(Debug, Default)]
pub struct AcquisitionWorker {
    state: Mutex<WorkerState>,
    started: AtomicU64,
}

impl AcquisitionWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Number of acquisition threads started so far.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the worker, or hand the create token to the one already running.
    pub(crate) fn start(&self, manager: Arc<ManagerShared>) -> Result<()> {
        if !self.claim() {
            debug!("Acquisition worker already running, requesting another run");
            return Ok(());
        }

        let run_number = self.started.fetch_add(1, Ordering::AcqRel) + 1;
        let spawned = thread::Builder::new()
            .name("pitwall-acquisition".to_string())
            .spawn(move || {
                let outcome = run(&manager);
                debug!(run_number, ?outcome, "Acquisition worker exited");
            });

        match spawned {
            Ok(_) => {
                debug!(run_number, "Started acquisition worker");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = WorkerState::default();
                Err(ConnectionError::connection_failed_with_source(
                    "Failed to spawn acquisition worker thread",
                    Arc::new(e),
                ))
            }
        }
    }

    /// Mark the worker running. False when it already was; the running
    /// worker then owes another run.
    fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            state.rerun = true;
            return false;
        }
        state.running = true;
        true
    }

    /// Stop running. Callers re-signal create themselves, so a pending rerun
    /// is folded into that signal.
    fn finish(&self) {
        *self.state.lock() = WorkerState::default();
    }

    /// Hand the create token over to a freshly published connection. Returns
    /// false, and keeps running, when that connection already closed and
    /// gave the token back to this worker.
    fn hand_over(&self) -> bool {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.rerun) {
            return false;
        }
        state.running = false;
        true
    }
}

fn run(manager: &Arc<ManagerShared>) -> AcquisitionOutcome {
    let worker = &manager.acquisition;
    let mut polls = 0u64;

    loop {
        if manager.objects.is_disposed() {
            worker.finish();
            return AcquisitionOutcome::Disposed;
        }

        manager.requests.expire_async_requests();

        let aborted = manager.requests.try_abort(|| {
            worker.finish();
            manager.objects.signal_create();
        });
        if aborted {
            debug!(polls, "No pending connection requests, acquisition aborted");
            return AcquisitionOutcome::Aborted;
        }

        let wait = next_wait(manager);
        match attach(manager, wait) {
            Ok(None) => {
                polls += 1;
                trace!(polls, wait_ms = wait.as_millis() as u64, "Simulator not available yet");
            }
            Ok(Some(attachment)) => {
                if let Some(outcome) = publish(manager, attachment) {
                    return outcome;
                }
            }
            Err(e) => {
                fail(manager, e);
                return AcquisitionOutcome::Failed;
            }
        }
    }
}

/// Poll interval, shortened to the earliest queued async deadline.
fn next_wait(manager: &ManagerShared) -> Duration {
    let mut wait = manager.options.acquisition_poll_interval;
    if let Some(at) = manager.requests.next_async_deadline() {
        wait = wait.min(at.saturating_duration_since(Instant::now()));
    }
    wait.max(MIN_WAIT)
}

/// A panicking source is reported like any other attach failure.
fn attach(manager: &ManagerShared, wait: Duration) -> Result<Option<SimulatorAttachment>> {
    panic::catch_unwind(AssertUnwindSafe(|| manager.source.try_attach(wait)))
        .unwrap_or_else(|_| Err(ConnectionError::connection_failed("Simulator source panicked during attach")))
}

/// `None` when the connection closed before the hand-over and the worker
/// has to acquire again.
fn publish(manager: &Arc<ManagerShared>, attachment: SimulatorAttachment) -> Option<AcquisitionOutcome> {
    let connection_id = manager.next_connection_id();
    let owner: Weak<dyn InnerConnectionOwner> = Arc::downgrade(manager) as Weak<dyn InnerConnectionOwner>;
    let connection = OpenInnerConnection::new(
        connection_id,
        attachment,
        manager.idle_timeout(),
        manager.options.close_on_last_detach,
        owner,
    );

    if !manager.objects.set_connection(Arc::clone(&connection)) {
        manager.acquisition.finish();
        debug!(connection_id, "Manager disposed during acquisition, discarding connection");
        connection.dispose();
        return Some(AcquisitionOutcome::Disposed);
    }
    // From here the create token belongs to the connection; closing it
    // (even while the queue drains) may start the next acquisition.
    if !manager.acquisition.hand_over() {
        debug!(connection_id, "Connection closed before hand-over, acquiring again");
        return None;
    }
    info!(connection_id, "Simulator connection published");

    // Queued requests attach before the worker thread can deliver the first
    // data-ready pulse.
    manager.requests.process_async_request_queue(&**manager, true);

    if let Err(e) = connection.start_worker_thread() {
        warn!(connection_id, error = %e, "Failed to start connection worker thread");
        connection.close();
    }

    Some(AcquisitionOutcome::Published { connection_id })
}

fn fail(manager: &ManagerShared, error: ConnectionError) {
    let error = error.into_connection_error();
    warn!(error = %error, "Failed to create simulator connection");

    let _block = manager.requests.block_requests();
    manager.objects.set_connection_exception(error);
    manager.requests.process_async_request_queue(manager, false);
    manager.requests.wait_for_executing_requests();
    manager.objects.clear_connection_exception();
    manager.acquisition.finish();
    manager.objects.signal_create();
}
