//! Runtime configuration for the execution backends.
//!
//! Every field has a sensible default so a host can start with
//! `RuntimeConfig::default()` and only override what its deployment needs:
//! a resource bundle directory for embedded-style installs, a hosted
//! interpreter override for the sandbox, and the timeout knobs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ExecutorError;

/// Which backend the selector should hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Prefer the native bridge, fall back to the sandbox.
    #[default]
    Auto,
    /// Native bridge only; fail if it is unavailable.
    Native,
    /// Sandboxed backend only; fail if it is unavailable.
    Sandbox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Resource bundle directory holding the standard-library archive and the
    /// sandbox bootstrap program. When unset, the embedded interpreter uses
    /// its own stdlib and the sandbox falls back to the built-in bootstrap.
    #[serde(default)]
    pub resource_root: Option<PathBuf>,
    /// Extra directories prepended to the embedded interpreter's import path.
    #[serde(default)]
    pub extra_package_dirs: Vec<PathBuf>,
    /// Interpreter binary hosting the sandbox container. Discovered on PATH
    /// when unset.
    #[serde(default)]
    pub sandbox_interpreter: Option<PathBuf>,
    /// How long to wait for the sandbox container's ready signal. Cold-starts
    /// of a hosted interpreter can be slow, hence the generous default.
    #[serde(default = "default_ready_timeout_secs")]
    pub sandbox_ready_timeout_secs: u64,
    /// Optional wall-clock limit applied by the selector around a whole run.
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
    #[serde(default)]
    pub preference: BackendPreference,
}

fn default_ready_timeout_secs() -> u64 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resource_root: None,
            extra_package_dirs: Vec::new(),
            sandbox_interpreter: None,
            sandbox_ready_timeout_secs: default_ready_timeout_secs(),
            execution_timeout_secs: None,
            preference: BackendPreference::Auto,
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ExecutorError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ExecutorError::ConfigError(format!(
                "could not read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| ExecutorError::ConfigError(e.to_string()))
    }

    /// Builds a configuration from defaults plus `RUNPAD_*` environment
    /// overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("RUNPAD_RESOURCE_DIR") {
            if !root.is_empty() {
                config.resource_root = Some(PathBuf::from(root));
            }
        }
        if let Ok(interpreter) = std::env::var("RUNPAD_SANDBOX_INTERPRETER") {
            if !interpreter.is_empty() {
                config.sandbox_interpreter = Some(PathBuf::from(interpreter));
            }
        }
        if let Ok(secs) = std::env::var("RUNPAD_READY_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.sandbox_ready_timeout_secs = secs;
            }
        }
        config
    }

    pub fn sandbox_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_ready_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}
