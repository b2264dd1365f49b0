//! Cluster error types

use jobgrid_queue::{RegistryError, StoreError};

use crate::protocol::ProtocolError;

/// Errors from controller, dispatch, and execution paths
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Work-type registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Wire protocol failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Network failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end reported the job could not be performed
    #[error("remote execution failed: {0}")]
    Remote(String),

    /// No worker has spare capacity
    #[error("no worker has available capacity")]
    NoCapacity,

    /// The connection task behind a handle has exited
    #[error("connection closed")]
    ConnectionClosed,

    /// Controller lifecycle misuse
    #[error("invalid controller state: {0}")]
    InvalidState(&'static str),
}
