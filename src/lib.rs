//! Shared connection management for iRacing's live telemetry memory.
//!
//! Pitwall Connect lets many parts of one process hold a connection to the
//! simulator while only one physical attachment to its shared memory exists.
//! The attachment is created on demand, shared, torn down when the last
//! handle leaves or the simulator goes quiet, and recreated for the next
//! caller.
//!
//! # Features
//!
//! - **Shared attachment**: any number of [`SimulatorConnection`] handles over
//!   one mapped view
//! - **Blocking and async opens**: fixed-budget timeouts, cooperative
//!   cancellation, and connection errors delivered to every waiter
//! - **Consistent reads**: tick- and revision-bracketed copies of data buffers
//!   and session info that the simulator rewrites in place
//! - **Offline testing**: [`LocalSimulator`] implements the same memory layout
//!   in-process on any platform
//!
//! # Quick Start
//!
//! ```rust
//! use pitwall_connect::{ConnectionManager, ConnectionOptions, LocalSimulator, Value, VariableType};
//! use std::time::Duration;
//!
//! let simulator = LocalSimulator::builder()
//!     .variable("RPM", VariableType::Float, 1, "revs/min", "Engine rpm")
//!     .build()?;
//! simulator.start();
//!
//! let manager = ConnectionManager::new(simulator.clone(), ConnectionOptions::default())?;
//! let connection = manager.connect(Some(Duration::from_secs(5)))?;
//!
//! let mut frame = simulator.new_frame();
//! simulator.write_value(&mut frame, "RPM", &Value::Float(7200.0))?;
//! simulator.publish_frame(&frame)?;
//!
//! let variables = connection.variables()?;
//! let mut buffer = Vec::new();
//! connection.read_latest_buffer(&mut buffer)?;
//! assert_eq!(variables.value("RPM", &buffer)?, Value::Float(7200.0));
//! # Ok::<(), pitwall_connect::ConnectionError>(())
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod signal;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Shared memory and its layout
pub mod data;
pub mod memory;

// Connection management
pub mod command;
pub mod connection;

// Platform-specific modules
#[cfg(windows)]
pub mod windows;

// Core exports
pub use config::ConnectionOptions;
pub use error::*;
pub use signal::{AutoResetEvent, DataReadySignal, WaitResult};

// Data exports
pub use data::{BufferSnapshot, DataFileHeader, SessionInfoText, Value, VariableHeader, VariableTable, VariableType};
pub use memory::local::LocalSimulator;
pub use memory::{MemorySnapshot, SharedRegion, SimulatorAttachment, SimulatorSource};

// Connection exports
pub use command::{BroadcastCommand, CommandMessage, CommandSink};
pub use connection::{ConnectFuture, ConnectionManager, ConnectionState, PendingRequests, SimulatorConnection};

// Windows exports
#[cfg(windows)]
pub use windows::{BroadcastSender, WindowsSimulator};
