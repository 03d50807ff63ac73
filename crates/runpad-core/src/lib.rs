//! Execution subsystem for running user-supplied Python snippets.
//!
//! This crate provides a pluggable runtime abstraction that dispatches a code
//! string to one of two structurally different backends and returns a uniform
//! result under a single asynchronous contract:
//!
//! - **Native bridge**: an embedded CPython interpreter reached in-process
//!   through the pyo3 FFI layer, with captured output streams and best-effort
//!   interruption.
//! - **Sandboxed backend**: an interpreter hosted inside an out-of-process,
//!   message-driven container, with request/response correlation and a
//!   bounded readiness wait.
//!
//! A once-per-process availability probe decides which backends are usable,
//! and a selector exposes the best available choice to the host application.

pub mod config;
pub mod errors;
pub mod executors;

pub use config::{BackendPreference, RuntimeConfig};
pub use errors::ExecutorError;
pub use executors::availability::{probe_runtimes, RuntimeAvailability, RuntimeSelector};
pub use executors::{ExecutionRequest, ExecutionResult, ScriptExecutor};
