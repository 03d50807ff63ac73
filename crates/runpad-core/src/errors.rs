//! Error types for the execution subsystem.
//!
//! Script-level failures are deliberately absent from this taxonomy: a script
//! that raises is a normal [`ExecutionResult`](crate::ExecutionResult) with a
//! non-zero exit code, so the host can render it like any other output. The
//! variants here cover the cases where no result can be produced at all.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    /// No interpreter can serve the request: resource bundle missing,
    /// initialization failed, or the sandbox never booted. Not retryable
    /// within this process.
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    /// The backend itself faulted while running a script. Distinct from the
    /// script raising, which is reported as a result with exit code 1.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    /// A sandbox message could not be delivered, or the container died before
    /// answering.
    #[error("sandbox transport failed: {0}")]
    TransportFailed(String),
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),
    /// The selector's wall-clock execution limit elapsed.
    #[error("script execution timed out")]
    Timeout,
}
