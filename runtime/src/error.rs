//! Error types for the world manager, communicator, and watchdog.

use thiserror::Error;

/// Errors surfaced by a [`crate::transport::Transport`] implementation.
///
/// The core never constructs these itself; transports return them, and the
/// communicator classifies them against
/// [`crate::config::ManagerConfig::classified_faults`] to decide whether a
/// fault means the world is broken or should propagate unchanged.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transport init failed: {0}")]
    InitFailed(String),
    #[error("transport fault: {0}")]
    Fault(String),
}

/// Errors surfaced by a [`crate::store::RendezvousStore`].
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("store timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

/// The public error type returned by [`crate::manager::WorldManager`] and
/// [`crate::communicator::WorldCommunicator`] operations.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("world {0} already exists")]
    AlreadyExists(String),
    #[error("world {0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The world is no longer usable; `reason` records why (a watchdog-
    /// observed heartbeat miss, a transport fault, or a store failure during
    /// the heartbeat loop). Terminal: a world never leaves this state.
    #[error("world {name} is broken: {reason}")]
    BrokenWorld { name: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An unclassified transport fault, rethrown unchanged. The core never
    /// swallows a transport error it doesn't recognize (spec propagation
    /// policy: "Unclassified transport faults ⇒ propagate unchanged").
    #[error(transparent)]
    Fatal(#[from] TransportError),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}
