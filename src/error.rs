//! Error types for simulator connection management.
//!
//! Every failure surfaced by the connection subsystem is a [`ConnectionError`].
//! The type is `Clone` because a single failed attach attempt is recorded once
//! and then handed to every waiter that asked for a connection while it was
//! current.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: the physical attachment could not be created
//! - **Timeouts**: the caller's budget elapsed with no connection available
//! - **State Errors**: an operation was called in an illegal lifecycle state
//! - **Disposed Errors**: a component was used after its owner released it
//! - **Memory / Parse Errors**: the shared region could not be decoded
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use pitwall_connect::ConnectionError;
//!
//! let error = ConnectionError::connection_failed("simulator rejected the mapping");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(windows)]
use windows_core as core;

/// Result type alias for connection operations.
pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;

/// Shared, clonable error source.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Main error type for connection operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to simulator: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<ErrorSource>,
    },

    #[error("Timed out after {duration:?} waiting for a simulator connection")]
    Timeout { duration: Duration },

    #[error("Cannot {operation} while the connection is {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("{object} has been disposed")]
    Disposed { object: &'static str },

    #[error("Connection request was canceled")]
    Canceled,

    #[error("Memory access violation at offset {offset:#x}")]
    Memory { offset: usize },

    #[error("SDK version mismatch: expected {expected}, found {found}")]
    Version { expected: i32, found: i32 },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("{feature} is only available on {required_platform}")]
    UnsupportedPlatform { feature: String, required_platform: String },

    #[error("Windows API error: {operation}")]
    #[cfg(windows)]
    WindowsApi {
        operation: String,
        #[source]
        source: core::Error,
    },
}

impl ConnectionError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Connection { .. } => true,
            ConnectionError::Timeout { .. } => true,
            ConnectionError::Canceled => true,
            ConnectionError::InvalidState { .. } => false,
            ConnectionError::Disposed { .. } => false,
            ConnectionError::Memory { .. } => false,
            ConnectionError::Version { .. } => false,
            ConnectionError::Parse { .. } => false,
            ConnectionError::Configuration { .. } => false,
            ConnectionError::UnsupportedPlatform { .. } => false,
            #[cfg(windows)]
            ConnectionError::WindowsApi { .. } => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ConnectionError::Connection { .. } => vec![
                "Ensure the simulator is running",
                "Check Windows permissions for shared memory access",
                "Retry opening the connection",
            ],
            ConnectionError::Timeout { .. } => vec![
                "Increase the open timeout",
                "Start the simulator before opening the connection",
            ],
            ConnectionError::Canceled => vec!["Issue a new open request if still needed"],
            ConnectionError::InvalidState { .. } => vec![
                "Create a new connection handle instead of reopening a closed one",
                "Await the in-flight open before starting another",
            ],
            ConnectionError::Disposed { .. } => vec![
                "Create a new connection manager",
                "Do not use connection handles after disposal",
            ],
            ConnectionError::Memory { .. } => vec![
                "Check memory access bounds",
                "Verify shared memory is still valid",
            ],
            ConnectionError::Version { .. } => vec![
                "Update the simulator to the latest version",
                "Update library to compatible version",
            ],
            ConnectionError::Parse { .. } => vec![
                "Check data format compatibility",
                "Verify source data integrity",
            ],
            ConnectionError::Configuration { .. } => vec![
                "Use positive, non-zero timeouts",
                "Check configuration file syntax",
            ],
            ConnectionError::UnsupportedPlatform { .. } => vec![
                "Use the local simulator source on this platform",
                "Check documentation for platform requirements",
            ],
            #[cfg(windows)]
            ConnectionError::WindowsApi { .. } => vec![
                "Check Windows API permissions",
                "Verify system resources availability",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        ConnectionError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(reason: impl Into<String>, source: ErrorSource) -> Self {
        ConnectionError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for lifecycle violations.
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        ConnectionError::InvalidState { operation, state: state.to_string() }
    }

    /// Helper constructor for disposed-object access.
    pub fn disposed(object: &'static str) -> Self {
        ConnectionError::Disposed { object }
    }

    /// Helper constructor for memory access errors.
    pub fn memory_access_error(offset: usize) -> Self {
        ConnectionError::Memory { offset }
    }

    /// Helper constructor for parse errors.
    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        ConnectionError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn configuration(reason: impl Into<String>) -> Self {
        ConnectionError::Configuration { reason: reason.into() }
    }

    /// Helper constructor for Windows API errors.
    #[cfg(windows)]
    pub fn windows_api_error(operation: impl Into<String>, source: core::Error) -> Self {
        ConnectionError::WindowsApi { operation: operation.into(), source }
    }

    /// Helper constructor for unsupported platform errors.
    pub fn unsupported_platform(
        feature: impl Into<String>,
        required_platform: impl Into<String>,
    ) -> Self {
        ConnectionError::UnsupportedPlatform {
            feature: feature.into(),
            required_platform: required_platform.into(),
        }
    }

    /// Wrap any failure raised while creating the physical attachment into a
    /// connection-level error. Connection errors pass through unchanged.
    pub fn into_connection_error(self) -> Self {
        match self {
            ConnectionError::Connection { .. } => self,
            other => ConnectionError::connection_failed_with_source(
                "Failed to attach to simulator shared memory",
                Arc::new(other),
            ),
        }
    }
}

#[cfg(windows)]
impl From<core::Error> for ConnectionError {
    fn from(err: core::Error) -> Self {
        ConnectionError::WindowsApi {
            operation: "Unknown Windows operation".to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn error_messages_carry_their_context(
            reason in ".*",
            offset in 0usize..0x10000usize,
            duration_ms in 1u64..60000u64,
            details in ".*"
        ) {
            let connection = ConnectionError::connection_failed(reason.clone());
            prop_assert!(connection.to_string().contains(&reason));

            let memory = ConnectionError::memory_access_error(offset);
            prop_assert!(memory.to_string().contains(&format!("{:#x}", offset)), "memory error message should contain the offset");

            let timeout = ConnectionError::Timeout { duration: Duration::from_millis(duration_ms) };
            prop_assert!(!timeout.to_string().is_empty());

            let parse = ConnectionError::parse_error("header", details.clone());
            prop_assert!(parse.to_string().contains(&details));
        }

        #[test]
        fn wrapping_preserves_the_source_chain(base_message in "[a-z ]{1,32}") {
            let inner = ConnectionError::parse_error("header", base_message.clone());
            let wrapped = inner.into_connection_error();

            prop_assert!(matches!(wrapped, ConnectionError::Connection { .. }), "wrapped error should be ConnectionError::Connection");
            let source = std::error::Error::source(&wrapped);
            prop_assert!(source.is_some());
            prop_assert!(source.map(|s| s.to_string().contains(&base_message)).unwrap_or(false));
        }
    }

    #[test]
    fn connection_errors_are_not_rewrapped() {
        let error = ConnectionError::connection_failed("mapping missing");
        match error.into_connection_error() {
            ConnectionError::Connection { reason, source } => {
                assert_eq!(reason, "mapping missing");
                assert!(source.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + Clone + 'static>() {}
        assert_send_sync_static::<ConnectionError>();

        let error = ConnectionError::connection_failed("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn timeouts_and_connection_errors_are_distinguishable() {
        let timeout = ConnectionError::Timeout { duration: Duration::from_secs(1) };
        let connection = ConnectionError::connection_failed("no mapping");

        assert!(matches!(timeout, ConnectionError::Timeout { .. }));
        assert!(matches!(connection, ConnectionError::Connection { .. }));
        assert!(timeout.is_retryable());
        assert!(!ConnectionError::disposed("manager").is_retryable());
        assert!(!ConnectionError::invalid_state("open", "closed").is_retryable());
    }

    #[test]
    fn recovery_suggestions_are_descriptive() {
        let errors = [
            ConnectionError::connection_failed("test"),
            ConnectionError::Timeout { duration: Duration::from_millis(10) },
            ConnectionError::Version { expected: 2, found: 1 },
            ConnectionError::configuration("zero idle timeout"),
        ];

        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            for suggestion in suggestions {
                assert!(suggestion.len() > 5);
            }
        }
    }
}
