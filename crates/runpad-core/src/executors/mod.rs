//! Execution backends for user-supplied script snippets.
//!
//! Defines the shared request/result vocabulary and the single asynchronous
//! operation every backend implements. Two backends exist: an in-process
//! embedded interpreter ([`native`], behind the `native-python` feature) and
//! an out-of-process sandboxed interpreter behind a message protocol
//! ([`sandbox`]). [`availability`] probes which of them can serve requests
//! and hands out the best available one.

use async_trait::async_trait;

use crate::errors::ExecutorError;

pub mod availability;
pub mod container;
#[cfg(feature = "native-python")]
pub mod native;
pub mod sandbox;

#[cfg(test)]
mod sandbox_test;
#[cfg(test)]
mod selector_test;

/// An immutable execution request carrying the script text.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    code: String,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// True when the request carries no executable text. Blank requests are
    /// rejected before they reach a backend.
    pub fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }
}

/// Terminal outcome of a run: captured output plus an exit code.
///
/// `exit_code` is `Some(0)` on success, non-zero when the script raised, and
/// `None` when the backend could not determine one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Result used when a request is rejected before reaching any backend.
    pub(crate) fn rejected(reason: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{}\n", reason),
            exit_code: Some(1),
        }
    }
}

/// The execution contract all backends implement.
///
/// `execute` suspends the caller until exactly one terminal outcome exists:
/// an [`ExecutionResult`] (including script errors, carried as data) or an
/// [`ExecutorError`]. Backends never stream partial state through this
/// contract.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Fire-and-forget, best-effort request to stop the current run. No
    /// timing guarantee; backends without a stop mechanism ignore it.
    fn request_stop(&self) {}
}
