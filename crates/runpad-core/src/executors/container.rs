//! Message protocol and process host for the sandboxed interpreter container.
//!
//! The container is a child process running a bootstrap program. Messages
//! flow upward as single-line JSON on its stdout; the backend invokes the
//! container's run entry point by writing one line `run <id> <escaped code>`
//! to its stdin. The escape step keeps arbitrary source text inside that
//! line-oriented framing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::errors::ExecutorError;

/// Bootstrap program shipped with the crate, used when the resource bundle
/// does not provide one.
const BOOTSTRAP_SOURCE: &str = include_str!("../../assets/sandbox_bootstrap.py");

/// Messages the container posts back to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerMessage {
    /// The hosted interpreter finished booting.
    Ready,
    /// Terminal outcome for the request identified by `id`.
    Result {
        id: Uuid,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    /// A failure report. With an `id` it resolves that request; without one
    /// it describes a boot failure (or is unroutable noise after boot).
    Error {
        #[serde(default)]
        id: Option<Uuid>,
        message: String,
    },
}

/// The container side of the sandbox: one entry point, invoked with
/// `(escaped code, id)`. Implemented by the real child process and by
/// scripted fakes in tests.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    async fn invoke_run(&self, escaped_code: &str, id: Uuid) -> Result<(), ExecutorError>;
}

/// Escapes source text for transport through the single-line run entry
/// point. Backslash, double quote, CR, LF and the Unicode line/paragraph
/// separators are neutralized; the bootstrap reverses the mapping.
pub fn escape_for_dispatch(code: &str) -> String {
    let mut out = String::with_capacity(code.len() + 8);
    for ch in code.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out
}

/// Resolves the interpreter binary that hosts the container: the configured
/// override if any, otherwise the first Python found on PATH.
pub fn resolve_interpreter(config: &RuntimeConfig) -> Option<PathBuf> {
    if let Some(interpreter) = &config.sandbox_interpreter {
        return Some(interpreter.clone());
    }
    which::which("python3")
        .or_else(|_| which::which("python"))
        .ok()
}

/// Resolves the bootstrap program, trying candidate locations in order:
/// `sandbox/bootstrap.py` then `bootstrap.py` under the resource root, and
/// finally a staged copy of the embedded bootstrap.
pub fn resolve_bootstrap(config: &RuntimeConfig) -> Result<PathBuf, ExecutorError> {
    if let Some(root) = &config.resource_root {
        let candidates = [root.join("sandbox/bootstrap.py"), root.join("bootstrap.py")];
        for candidate in candidates {
            if candidate.is_file() {
                log::debug!("using bundled sandbox bootstrap {}", candidate.display());
                return Ok(candidate);
            }
        }
        log::debug!(
            "no sandbox bootstrap under {}, falling back to the embedded copy",
            root.display()
        );
    }
    embedded_bootstrap()
}

/// Stages the embedded bootstrap into a process-scoped temp directory once.
fn embedded_bootstrap() -> Result<PathBuf, ExecutorError> {
    static STAGED: OnceLock<Result<PathBuf, String>> = OnceLock::new();
    STAGED
        .get_or_init(|| {
            let dir = tempfile::Builder::new()
                .prefix("runpad-sandbox-")
                .tempdir()
                .map_err(|e| format!("could not stage embedded bootstrap: {}", e))?;
            let path = dir.path().join("bootstrap.py");
            std::fs::write(&path, BOOTSTRAP_SOURCE)
                .map_err(|e| format!("could not stage embedded bootstrap: {}", e))?;
            // The staged file must outlive this call; it is process-scoped
            // like the container itself.
            let _ = dir.into_path();
            Ok(path)
        })
        .clone()
        .map_err(ExecutorError::RuntimeUnavailable)
}

/// A container hosted in a child process.
pub struct ProcessContainer {
    stdin: Mutex<ChildStdin>,
    // Held so the child is reaped (and killed) when the container drops.
    #[allow(dead_code)]
    child: std::sync::Mutex<Child>,
}

impl ProcessContainer {
    /// Spawns the hosted interpreter over the bootstrap program and starts a
    /// reader task that decodes its message stream. Returns the handle plus
    /// the inbound messages; the channel closes when the process exits.
    pub fn spawn(
        interpreter: &Path,
        bootstrap: &Path,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ContainerMessage>), ExecutorError> {
        let mut child = Command::new(interpreter)
            .arg(bootstrap)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::RuntimeUnavailable(format!(
                    "failed to start sandbox container {}: {}",
                    interpreter.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ExecutorError::RuntimeUnavailable("sandbox container has no stdout".to_string())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ExecutorError::RuntimeUnavailable("sandbox container has no stdin".to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ContainerMessage>(line) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("dropping undecodable container message: {}", e)
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("container stdout read failed: {}", e);
                        break;
                    }
                }
            }
            log::info!("sandbox container message stream closed");
        });

        Ok((
            Arc::new(Self {
                stdin: Mutex::new(stdin),
                child: std::sync::Mutex::new(child),
            }),
            rx,
        ))
    }
}

#[async_trait]
impl ContainerHandle for ProcessContainer {
    async fn invoke_run(&self, escaped_code: &str, id: Uuid) -> Result<(), ExecutorError> {
        let line = format!("run {} {}\n", id, escaped_code);
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            ExecutorError::TransportFailed(format!("could not queue run call: {}", e))
        })?;
        stdin.flush().await.map_err(|e| {
            ExecutorError::TransportFailed(format!("could not flush run call: {}", e))
        })
    }
}
