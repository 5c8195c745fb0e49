//! Per-connection data-ready worker thread.
//!
//! One dedicated thread per open inner connection waits on the simulator's
//! data-ready signal and forwards each pulse to the owner. When no pulse
//! arrives for the owner's idle timeout, the simulator is considered gone and
//! the thread exits, reporting `canceled = false`. An explicit stop reports
//! `canceled = true`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::signal::WaitResult;
use crate::{ConnectionError, Result};

/// Longest single wait, so a stop request is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

pub trait WorkerThreadOwner: Send + Sync {
    /// Re-read on every iteration.
    fn idle_timeout(&self) -> Duration;

    fn wait_for_data(&self, timeout: Duration) -> Result<WaitResult>;

    fn on_data_ready(&self);

    fn on_worker_thread_exit(&self, canceled: bool);
}

#[derive(Debug)]
pub struct ConnectionWorkerThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionWorkerThread {
    pub fn spawn(name: String, owner: Weak<dyn WorkerThreadOwner>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(owner, thread_stop))
            .map_err(|e| {
                ConnectionError::connection_failed_with_source("Failed to spawn connection worker thread", Arc::new(e))
            })?;

        Ok(Self { stop, handle: Some(handle) })
    }

    /// Ask the thread to exit. Does not wait, so it is safe to call from the
    /// worker thread itself.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Stop and wait for the thread to exit.
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(owner: Weak<dyn WorkerThreadOwner>, stop: Arc<AtomicBool>) {
    debug!("Connection worker thread started");
    let mut idle = Duration::ZERO;

    loop {
        let Some(owner) = owner.upgrade() else {
            debug!("Connection worker owner dropped");
            return;
        };

        if stop.load(Ordering::Acquire) {
            info!("Connection worker thread stopped");
            owner.on_worker_thread_exit(true);
            return;
        }

        let idle_timeout = owner.idle_timeout();
        debug_assert!(!idle_timeout.is_zero(), "idle timeout must be positive");

        if idle >= idle_timeout {
            info!(idle_ms = idle.as_millis() as u64, "No data from simulator, connection worker exiting");
            owner.on_worker_thread_exit(false);
            return;
        }

        let slice = (idle_timeout - idle).min(WAIT_SLICE);
        let started = Instant::now();
        match owner.wait_for_data(slice) {
            Ok(WaitResult::Signaled) => {
                idle = Duration::ZERO;
                owner.on_data_ready();
            }
            Ok(WaitResult::Timeout) => idle += started.elapsed().max(slice),
            Err(e) => {
                warn!(error = %e, "Data-ready wait failed, connection worker exiting");
                owner.on_worker_thread_exit(false);
                return;
            }
        }
    }
}
