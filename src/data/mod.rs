//! Telemetry region decoding.
//!
//! - [`header`]: the fixed-offset `irsdk_header`
//! - [`buffer`]: tick-bracketed reads of the rotating data buffers
//! - [`session`]: revision-bracketed reads of the session info YAML
//! - [`variables`]: the `irsdk_varHeader` table and value decoding
//!
//! Nothing here locks the region. The simulator is not a cooperating party,
//! so every multi-word read is validated against a revision counter instead.

pub mod buffer;
pub mod header;
pub mod session;
pub mod variables;

pub use buffer::{BufferSnapshot, read_latest_buffer, read_latest_buffer_into};
pub use header::{DataBufferInfo, DataFileHeader, HEADER_SIZE, IRSDK_STATUS_CONNECTED, IRSDK_VER, MAX_BUFFERS};
pub use session::SessionInfoText;
pub use variables::{Value, VariableHeader, VariableTable, VariableType, VARIABLE_HEADER_SIZE};
