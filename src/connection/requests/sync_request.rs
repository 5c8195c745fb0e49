//! Blocking connection requests.

use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

use super::ConnectionProvider;
use crate::connection::deadline::Deadline;
use crate::connection::inner::OpenInnerConnection;
use crate::connection::tracker::OuterConnection;
use crate::{ConnectionError, Result};

/// One blocking attempt by an outer connection to attach to the current
/// inner connection before `deadline`.
pub struct ConnectionRequest {
    outer: Arc<dyn OuterConnection>,
    deadline: Deadline,
}

impl ConnectionRequest {
    pub fn new(outer: Arc<dyn OuterConnection>, deadline: Deadline) -> Self {
        Self { outer, deadline }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Wait for a connection and attach to it. Attach races (the connection
    /// closed between publish and attach) are retried until the deadline.
    pub fn execute(&self, provider: &dyn ConnectionProvider) -> Result<Arc<OpenInnerConnection>> {
        let mut lost_races = 0u32;

        loop {
            {
                let _scope = provider.request_manager().create_scope();
                if let Some(connection) = provider.try_get_connection(&self.deadline, true)? {
                    if connection.attach(Arc::clone(&self.outer)) {
                        debug!(
                            outer_id = self.outer.id(),
                            connection_id = connection.id(),
                            lost_races,
                            "Connection request attached"
                        );
                        return Ok(connection);
                    }
                    lost_races += 1;
                    trace!(outer_id = self.outer.id(), connection_id = connection.id(), "Attach lost a close race");
                }
            }

            if self.outer.is_closed() {
                return Err(ConnectionError::disposed("connection"));
            }

            if self.deadline.is_expired() {
                return self.last_chance(provider);
            }

            thread::yield_now();
        }
    }

    /// One non-blocking attempt without creating, giving an in-flight
    /// acquisition a final chance before reporting the timeout.
    fn last_chance(&self, provider: &dyn ConnectionProvider) -> Result<Arc<OpenInnerConnection>> {
        let _scope = provider.request_manager().create_scope();
        if let Some(connection) = provider.try_get_connection(&Deadline::immediate(), false)? {
            if connection.attach(Arc::clone(&self.outer)) {
                return Ok(connection);
            }
        }

        debug!(outer_id = self.outer.id(), budget_ms = self.deadline.budget().as_millis() as u64, "Connection request timed out");
        Err(ConnectionError::Timeout { duration: self.deadline.budget() })
    }
}
