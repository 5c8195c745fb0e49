//! Shared connection management.
//!
//! Many [`SimulatorConnection`] handles (outer connections) multiplex one
//! physical attachment (the inner connection). The [`ConnectionManager`]
//! creates the attachment on demand, shares it between handles and recreates
//! it after it closes.
//!
//! ## Architecture
//!
//! - [`ConnectionManager`] waits on three conditions: a connection is
//!   available, a connection exception is recorded, or the caller must create
//!   the connection. The create condition is consumed by one waiter, so one
//!   acquisition worker runs no matter how many callers race.
//! - The acquisition worker polls the [`SimulatorSource`](crate::memory::SimulatorSource),
//!   publishes the new inner connection, drains queued async requests and
//!   only then starts the connection's data-ready worker thread.
//! - Requests carry a [`Deadline`] captured at creation and a scope in the
//!   pending-request counter; the worker gives up once nothing is pending.
//! - An [`OpenInnerConnection`] closes when its last handle detaches or its
//!   worker sees no data for the idle timeout. Still-attached handles are
//!   handed a [`ClosedInnerConnection`] snapshot.
//!
//! ## Lock order
//!
//! An inner connection's tracker lock is taken before a handle's state lock.
//! The slot lock of the object manager is taken before the signal lock.

mod acquisition;
pub mod deadline;
pub mod inner;
mod manager;
pub mod objects;
mod outer;
pub mod requests;
pub mod signals;
pub mod tracker;
pub mod worker;


pub use acquisition::{AcquisitionOutcome, AcquisitionWorker};
pub use deadline::Deadline;
pub use inner::{ClosedInnerConnection, InnerConnection, InnerConnectionOwner, OpenInnerConnection};
pub use manager::ConnectionManager;
pub use objects::ConnectionObjectManager;
pub use outer::{ConnectionState, SimulatorConnection};
pub use requests::{ConnectFuture, ConnectionProvider, ConnectionRequestManager, PendingRequests};
pub use signals::{ConnectionRequestSignals, ConnectionSignals, ConnectionWaitResult};
pub use tracker::{Detached, OuterConnection, OuterConnectionTracker};
pub use worker::{ConnectionWorkerThread, WorkerThreadOwner};
