//! Runtime availability probing and backend selection.
//!
//! Availability is computed at most once per process because the native probe
//! performs the real one-time interpreter initialization as a side effect.
//! The sandbox probe only checks that its assets are present, without booting
//! the container. Backend instances are process-scoped singletons: both
//! underlying interpreters are expensive to construct, and the native one is
//! not cleanly repeatable within a process.

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::container::{resolve_bootstrap, resolve_interpreter};
#[cfg(feature = "native-python")]
use super::native::NativeExecutor;
use super::sandbox::SandboxExecutor;
use super::{ExecutionRequest, ExecutionResult, ScriptExecutor};
use crate::config::{BackendPreference, RuntimeConfig};
use crate::errors::ExecutorError;

/// Which backends can serve requests, with one human-readable detail line
/// each. Cached for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct RuntimeAvailability {
    pub native_available: bool,
    pub native_detail: String,
    pub sandbox_present: bool,
    pub sandbox_detail: String,
}

static AVAILABILITY: OnceCell<RuntimeAvailability> = OnceCell::const_new();
#[cfg(feature = "native-python")]
static NATIVE: OnceCell<Arc<NativeExecutor>> = OnceCell::const_new();
static SANDBOX: OnceCell<Arc<SandboxExecutor>> = OnceCell::const_new();

/// Probes both backends. The first call does the work (including the native
/// bridge's one-time initialization); every later call returns the cached
/// record, regardless of the config it is handed.
pub async fn probe_runtimes(config: &RuntimeConfig) -> &'static RuntimeAvailability {
    AVAILABILITY
        .get_or_init(|| async {
            let (native_available, native_detail) = probe_native(config);
            let (sandbox_present, sandbox_detail) = probe_sandbox(config);
            log::info!(
                "runtime availability: native={} ({}); sandbox={} ({})",
                native_available,
                native_detail,
                sandbox_present,
                sandbox_detail
            );
            RuntimeAvailability {
                native_available,
                native_detail,
                sandbox_present,
                sandbox_detail,
            }
        })
        .await
}

#[cfg(feature = "native-python")]
fn probe_native(config: &RuntimeConfig) -> (bool, String) {
    match NativeExecutor::probe(config) {
        Ok(detail) => (true, detail),
        Err(err) => (false, err.to_string()),
    }
}

#[cfg(not(feature = "native-python"))]
fn probe_native(_config: &RuntimeConfig) -> (bool, String) {
    (
        false,
        "built without embedded interpreter support".to_string(),
    )
}

fn probe_sandbox(config: &RuntimeConfig) -> (bool, String) {
    let Some(interpreter) = resolve_interpreter(config) else {
        return (false, "no hosted interpreter on PATH".to_string());
    };
    match resolve_bootstrap(config) {
        Ok(bootstrap) => (
            true,
            format!(
                "{} with bootstrap {}",
                interpreter.display(),
                bootstrap.display()
            ),
        ),
        Err(err) => (false, err.to_string()),
    }
}

/// Resolves execution requests to a concrete backend under the configured
/// preference policy: native when available, otherwise the sandbox.
pub struct RuntimeSelector {
    config: RuntimeConfig,
}

impl RuntimeSelector {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Host entry point: rejects blank input before any backend is reached,
    /// resolves the preferred backend, and applies the optional wall-clock
    /// limit around the whole run.
    pub async fn execute(&self, code: &str) -> Result<ExecutionResult, ExecutorError> {
        let request = ExecutionRequest::new(code);
        if request.is_blank() {
            log::debug!("rejecting blank execution request");
            return Ok(ExecutionResult::rejected("no code provided"));
        }
        let backend = self.select().await?;
        match self.config.execution_timeout() {
            Some(limit) => match tokio::time::timeout(limit, backend.execute(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // The abandoned run may still hold the interpreter; ask it
                    // to wind down.
                    backend.request_stop();
                    Err(ExecutorError::Timeout)
                }
            },
            None => backend.execute(&request).await,
        }
    }

    /// Resolves the preferred backend, constructing and caching the
    /// process-wide singleton on first use.
    pub async fn select(&self) -> Result<Arc<dyn ScriptExecutor>, ExecutorError> {
        let availability = probe_runtimes(&self.config).await;
        match self.config.preference {
            BackendPreference::Native => self.native_backend(availability).await,
            BackendPreference::Sandbox => self.sandbox_backend(availability).await,
            BackendPreference::Auto => {
                if availability.native_available {
                    self.native_backend(availability).await
                } else if availability.sandbox_present {
                    self.sandbox_backend(availability).await
                } else {
                    Err(ExecutorError::RuntimeUnavailable(format!(
                        "no interpreter available (native: {}; sandbox: {})",
                        availability.native_detail, availability.sandbox_detail
                    )))
                }
            }
        }
    }

    /// Fire-and-forget stop, forwarded to whichever backends exist.
    pub fn request_stop(&self) {
        #[cfg(feature = "native-python")]
        if let Some(native) = NATIVE.get() {
            native.request_stop();
        }
        if let Some(sandbox) = SANDBOX.get() {
            sandbox.request_stop();
        }
    }

    #[cfg(feature = "native-python")]
    async fn native_backend(
        &self,
        availability: &RuntimeAvailability,
    ) -> Result<Arc<dyn ScriptExecutor>, ExecutorError> {
        if !availability.native_available {
            return Err(ExecutorError::RuntimeUnavailable(
                availability.native_detail.clone(),
            ));
        }
        let executor = NATIVE
            .get_or_try_init(|| async { NativeExecutor::new(&self.config).map(Arc::new) })
            .await?;
        Ok(Arc::clone(executor) as Arc<dyn ScriptExecutor>)
    }

    #[cfg(not(feature = "native-python"))]
    async fn native_backend(
        &self,
        availability: &RuntimeAvailability,
    ) -> Result<Arc<dyn ScriptExecutor>, ExecutorError> {
        Err(ExecutorError::RuntimeUnavailable(
            availability.native_detail.clone(),
        ))
    }

    async fn sandbox_backend(
        &self,
        availability: &RuntimeAvailability,
    ) -> Result<Arc<dyn ScriptExecutor>, ExecutorError> {
        if !availability.sandbox_present {
            return Err(ExecutorError::RuntimeUnavailable(
                availability.sandbox_detail.clone(),
            ));
        }
        let executor = SANDBOX
            .get_or_try_init(|| async { SandboxExecutor::spawn(&self.config).map(Arc::new) })
            .await?;
        Ok(Arc::clone(executor) as Arc<dyn ScriptExecutor>)
    }
}
