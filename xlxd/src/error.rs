//! Operation engine error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned synchronously by the operation engine and its collaborators.
///
/// Failures of a work function never show up here; they are recorded on the
/// operation itself.
#[derive(Debug, Error)]
pub enum OperationError {
    /// A resource is already claimed exclusively by another in-flight operation.
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// Unknown or reaped operation.
    #[error("operation not found: {0}")]
    NotFound(String),

    /// Cancel requested on a non-cancellable or terminal operation.
    #[error("operation cannot be cancelled: {0}")]
    NotCancelable(String),

    /// Admission cap exceeded.
    #[error("too many concurrent operations (limit {limit})")]
    Overloaded { limit: usize },

    /// The caller's deadline passed; the operation itself keeps running.
    #[error("timed out after {0:?} waiting for operation")]
    Timeout(Duration),

    /// Unknown or already consumed websocket secret.
    #[error("invalid websocket secret")]
    InvalidSecret,

    /// The operation already reached a terminal state.
    #[error("operation is not running: {0}")]
    OperationNotRunning(String),

    /// Delete requested while the operation is still pending or running.
    #[error("operation is still in progress: {0}")]
    NotTerminal(String),

    /// Unexpected fault inside the engine or a work function.
    #[error("internal error: {0}")]
    InternalFault(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, OperationError>;

/// Returned by a work function to signal that it stopped because
/// cancellation was requested.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("operation cancelled")]
pub struct Cancelled;
