//! Pool error types

/// Error returned by the raw database driver.
///
/// The pool cannot reliably distinguish "bad connection" from "bad query"
/// from the driver alone, so this carries the driver's message and the
/// pool applies its own reconnect heuristics on top.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been stopped; no further work is accepted
    #[error("connection pool is closed")]
    Closed,

    /// Operation on a committed/aborted transaction or an ended command block
    #[error("transaction already finished")]
    AlreadyFinished,

    /// A statement failed and was not recoverable by reconnecting
    #[error("statement failed: {0}")]
    Statement(String),

    /// Commit failed; the data may not have been persisted
    #[error("commit failed: {0}")]
    Commit(String),
}
