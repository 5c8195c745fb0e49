//! iRacing shared memory access on Windows.
//!
//! [`WindowsSimulator`] attaches the same way the official C++ SDK does:
//! open the data-valid event, wait for a pulse, then map the telemetry file
//! read-only and check the header version. A missing event or mapping means
//! the simulator is not running and is reported as "not yet", not as an
//! error.
//!
//! ```rust,ignore
//! use pitwall_connect::{ConnectionManager, ConnectionOptions};
//! use std::time::Duration;
//!
//! let manager = ConnectionManager::windows(ConnectionOptions::default())?;
//! let connection = manager.connection();
//! connection.open(Some(Duration::from_secs(10)))?;
//! ```

mod broadcast;
mod mapping;

pub use broadcast::BroadcastSender;
pub use mapping::{MappedView, NamedEvent};

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ConnectionOptions;
use crate::data::header::{DataFileHeader, IRSDK_VER};
use crate::memory::{SharedRegion, SimulatorAttachment, SimulatorSource};
use crate::signal::{DataReadySignal, WaitResult};
use crate::{ConnectionError, Result};

/// Attaches to the running simulator's shared memory by name.
#[derive(Debug, Clone)]
pub struct WindowsSimulator {
    memory_map_name: String,
    data_ready_event_name: String,
}

impl WindowsSimulator {
    pub fn new(options: &ConnectionOptions) -> Self {
        Self {
            memory_map_name: options.memory_map_name.clone(),
            data_ready_event_name: options.data_ready_event_name.clone(),
        }
    }
}

impl SimulatorSource for WindowsSimulator {
    fn try_attach(&self, wait: Duration) -> Result<Option<SimulatorAttachment>> {
        let Some(event) = NamedEvent::open(&self.data_ready_event_name)? else {
            // Nothing to wait on until the simulator creates the event.
            trace!(event = %self.data_ready_event_name, "Data-valid event not present");
            thread::sleep(wait);
            return Ok(None);
        };

        if event.wait(wait)? == WaitResult::Timeout {
            trace!("Simulator present but not publishing data");
            return Ok(None);
        }

        let Some(view) = MappedView::open(&self.memory_map_name)? else {
            return Ok(None);
        };

        let header = DataFileHeader::read(&view)?;
        if header.version != IRSDK_VER {
            return Err(ConnectionError::Version { expected: IRSDK_VER, found: header.version });
        }

        debug!(
            bytes = view.len(),
            variables = header.variable_count,
            buffers = header.buffer_count,
            "Attached to simulator shared memory"
        );

        let memory: Arc<dyn SharedRegion> = Arc::new(view);
        let data_ready: Arc<dyn DataReadySignal> = Arc::new(event);
        Ok(Some(SimulatorAttachment::new(memory, data_ready)))
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;

    #[test]
    fn absent_simulator_is_not_an_error() {
        let options = ConnectionOptions {
            memory_map_name: "Local\\PitwallConnectAbsentMapping".to_string(),
            data_ready_event_name: "Local\\PitwallConnectAbsentEvent".to_string(),
            ..ConnectionOptions::default()
        };
        let simulator = WindowsSimulator::new(&options);
        assert!(simulator.try_attach(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    #[ignore = "iracing_required"]
    fn attaches_to_live_iracing() {
        let simulator = WindowsSimulator::new(&ConnectionOptions::default());
        let attachment = simulator
            .try_attach(Duration::from_secs(2))
            .expect("attach should not fail")
            .expect("iRacing should be running");

        let header = DataFileHeader::read_validated(attachment.memory.as_ref()).unwrap();
        assert!(header.tick_rate > 0);
        assert!(header.variable_count > 0);
    }
}
