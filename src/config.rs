//! Connection configuration.
//!
//! Options can be built in code or loaded from YAML:
//!
//! ```rust
//! use pitwall_connect::ConnectionOptions;
//! use std::time::Duration;
//!
//! let options = ConnectionOptions::from_yaml_str("idle_timeout: 2500\nclose_on_last_detach: false\n")?;
//! assert_eq!(options.idle_timeout, Duration::from_millis(2500));
//! assert!(!options.close_on_last_detach);
//! # Ok::<(), pitwall_connect::ConnectionError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConnectionError, Result};

/// iRacing shared memory file name
pub const DEFAULT_MEMORY_MAP_NAME: &str = "Local\\IRSDKMemMapFileName";
/// iRacing data valid event name
pub const DEFAULT_DATA_READY_EVENT_NAME: &str = "Local\\IRSDKDataValidEvent";
/// iRacing broadcast window message name
pub const DEFAULT_BROADCAST_MESSAGE_NAME: &str = "IRSDK_BROADCASTMSG";

/// Tunables for connection acquisition and lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// How long a connection worker waits without a data-ready pulse before
    /// treating the simulator as gone (milliseconds in serialized form).
    #[serde(with = "millis")]
    pub idle_timeout: Duration,

    /// Longest single wait of the acquisition worker for the simulator to
    /// appear before it re-checks pending requests (milliseconds).
    #[serde(with = "millis")]
    pub acquisition_poll_interval: Duration,

    /// Close the physical attachment when its last handle detaches.
    pub close_on_last_detach: bool,

    /// Name of the telemetry file mapping.
    pub memory_map_name: String,

    /// Name of the auto-reset event pulsed on every new data buffer.
    pub data_ready_event_name: String,

    /// Name of the registered window message used for outbound commands.
    pub broadcast_message_name: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            acquisition_poll_interval: Duration::from_millis(100),
            close_on_last_detach: true,
            memory_map_name: DEFAULT_MEMORY_MAP_NAME.to_string(),
            data_ready_event_name: DEFAULT_DATA_READY_EVENT_NAME.to_string(),
            broadcast_message_name: DEFAULT_BROADCAST_MESSAGE_NAME.to_string(),
        }
    }
}

impl ConnectionOptions {
    /// Parse options from a YAML document and validate them.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let options: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| ConnectionError::configuration(format!("Invalid YAML: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Check that every duration is positive and every name is present.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(ConnectionError::configuration("idle_timeout must be positive"));
        }

        if self.acquisition_poll_interval.is_zero() {
            return Err(ConnectionError::configuration(
                "acquisition_poll_interval must be positive",
            ));
        }

        if self.memory_map_name.is_empty() || self.data_ready_event_name.is_empty() {
            return Err(ConnectionError::configuration("shared object names must not be empty"));
        }

        Ok(())
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_acquisition_poll_interval(mut self, interval: Duration) -> Self {
        self.acquisition_poll_interval = interval;
        self
    }

    pub fn with_close_on_last_detach(mut self, close_on_last_detach: bool) -> Self {
        self.close_on_last_detach = close_on_last_detach;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
