//! Native execution backend embedding a CPython interpreter in-process.
//!
//! The interpreter is process-wide state: its import path and output sinks
//! are shared across all calls. Initialization runs at
//! most once per process and cannot be retried after a failure; execution is
//! serialized through a single-flight slot because the interpreter is not
//! reentrant across overlapping top-level runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use async_trait::async_trait;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tokio::sync::mpsc;

use super::{ExecutionRequest, ExecutionResult, ScriptExecutor};
use crate::config::RuntimeConfig;
use crate::errors::ExecutorError;

/// One-shot initialization outcome: the detail string on success, the error
/// text on failure. First call wins; later calls observe the cached value.
static BRIDGE_INIT: OnceLock<Result<String, String>> = OnceLock::new();

/// One-shot streaming tap, guarded independently of [`BRIDGE_INIT`].
static OUTPUT_TAP: OnceLock<mpsc::Sender<OutputChunk>> = OnceLock::new();

/// Single-flight slot: only one run may own the interpreter at a time. Held
/// on the blocking worker itself, for the full duration of the script.
static RUN_SLOT: StdMutex<()> = StdMutex::new(());

/// Whether a run currently owns the interpreter. `request_stop` only arms an
/// interrupt while this is set, so an idle stop stays a no-op.
static RUN_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

/// Interpreter thread id of the worker owning the current run, 0 when idle.
/// `request_stop` needs it to target the right thread state.
static RUN_THREAD: AtomicU64 = AtomicU64::new(0);

/// Which interpreter stream a forwarded chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A chunk of interpreter output forwarded to the streaming tap.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

/// `sys.stdout`/`sys.stderr` replacement installed for the duration of a run:
/// appends to a Rust-owned capture buffer and forwards to the streaming tap
/// when one is installed.
#[pyclass]
struct CaptureWriter {
    stream: StreamKind,
    buffer: Arc<StdMutex<String>>,
}

#[pymethods]
impl CaptureWriter {
    fn write(&self, data: &str) -> usize {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push_str(data);
        }
        if let Some(tap) = OUTPUT_TAP.get() {
            // A slow consumer drops chunks; the interpreter must not block.
            let _ = tap.try_send(OutputChunk {
                stream: self.stream,
                text: data.to_string(),
            });
        }
        data.len()
    }

    fn flush(&self) {}
}

/// The in-process embedded interpreter backend. All instances share the same
/// process-wide interpreter; the type is a handle, not a resource.
#[derive(Debug, Default)]
pub struct NativeExecutor;

impl NativeExecutor {
    /// Initializes the embedded interpreter (idempotent) and returns the
    /// backend handle.
    pub fn new(config: &RuntimeConfig) -> Result<Self, ExecutorError> {
        initialize(config)?;
        Ok(NativeExecutor)
    }

    /// Performs (or replays) the one-time initialization and returns its
    /// detail string.
    pub fn probe(config: &RuntimeConfig) -> Result<String, ExecutorError> {
        initialize(config)
    }

    /// Installs the streaming output tap. At most one tap per process: the
    /// first installation wins and later calls are no-ops, reported by the
    /// return value. The channel has a single-consumer contract and chunks
    /// are dropped rather than queued when it is full.
    pub fn install_output_tap(tap: mpsc::Sender<OutputChunk>) -> bool {
        OUTPUT_TAP.set(tap).is_ok()
    }
}

#[async_trait]
impl ScriptExecutor for NativeExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutorError> {
        // The slot and the in-flight state are owned by the blocking closure
        // itself. Dropping this future mid-run (e.g. a caller-side timeout)
        // cannot release the exclusion while the script is still executing;
        // the next run queues behind it on the blocking pool.
        let code = request.code().to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let _slot = RUN_SLOT.lock().unwrap_or_else(PoisonError::into_inner);
            RUN_IN_FLIGHT.store(true, Ordering::SeqCst);
            let result = run_script(&code);
            RUN_THREAD.store(0, Ordering::SeqCst);
            RUN_IN_FLIGHT.store(false, Ordering::SeqCst);
            result
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(join_err) => Err(ExecutorError::ExecutionFailed(format!(
                "execution worker failed: {}",
                join_err
            ))),
        }
    }

    /// Raises `KeyboardInterrupt` in the worker thread running the script.
    /// Best-effort: the exception lands at the next interpreter checkpoint,
    /// so a tight native extension call with no checkpoints may not be
    /// interruptible. Idle stops are no-ops.
    fn request_stop(&self) {
        if !RUN_IN_FLIGHT.load(Ordering::SeqCst) {
            log::debug!("stop requested while idle; ignoring");
            return;
        }
        let thread_id = RUN_THREAD.load(Ordering::SeqCst);
        if thread_id == 0 {
            return;
        }
        log::info!("requesting interpreter stop");
        Python::with_gil(|_py| {
            // The script runs on a blocking-pool thread, not the main thread,
            // so the interrupt must target that thread's state directly.
            let hit = unsafe {
                pyo3::ffi::PyThreadState_SetAsyncExc(
                    thread_id as std::os::raw::c_long,
                    pyo3::ffi::PyExc_KeyboardInterrupt,
                )
            };
            if hit == 0 {
                log::debug!("stop target thread already finished");
            }
        });
    }
}

fn initialize(config: &RuntimeConfig) -> Result<String, ExecutorError> {
    BRIDGE_INIT
        .get_or_init(|| init_interpreter(config))
        .clone()
        .map_err(ExecutorError::RuntimeUnavailable)
}

/// Locates the bundled standard-library archive under a resource root.
pub(crate) fn locate_stdlib_archive(root: &Path) -> Option<PathBuf> {
    ["python-stdlib.zip", "stdlib.zip"]
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

fn init_interpreter(config: &RuntimeConfig) -> Result<String, String> {
    let mut path_entries: Vec<PathBuf> = Vec::new();
    if let Some(root) = &config.resource_root {
        // A partially initialized interpreter cannot be retried or torn
        // down, so a missing archive fails before the interpreter is touched.
        match locate_stdlib_archive(root) {
            Some(archive) => path_entries.push(archive),
            None => {
                return Err(format!(
                    "standard-library archive not found under {}",
                    root.display()
                ))
            }
        }
    }
    for dir in &config.extra_package_dirs {
        if dir.is_dir() {
            path_entries.push(dir.clone());
        } else {
            log::warn!("skipping missing package directory {}", dir.display());
        }
    }

    pyo3::prepare_freethreaded_python();
    let detail = Python::with_gil(|py| -> PyResult<String> {
        let sys = py.import_bound("sys")?;
        let sys_path = sys.getattr("path")?;
        for entry in path_entries.iter().rev() {
            sys_path.call_method1("insert", (0, entry.to_string_lossy().as_ref()))?;
        }
        let version: String = sys.getattr("version")?.extract()?;
        Ok(format!(
            "embedded interpreter {}",
            version.split_whitespace().next().unwrap_or("?")
        ))
    })
    .map_err(|e| format!("interpreter initialization failed: {}", e))?;

    log::info!("native bridge initialized: {}", detail);
    Ok(detail)
}

/// Runs one script on the current (blocking) thread: swaps the interpreter's
/// output sinks to capture writers, executes the code against a fresh global
/// namespace, and restores the prior sinks on every exit path.
fn run_script(code: &str) -> Result<ExecutionResult, ExecutorError> {
    let stdout_buf = Arc::new(StdMutex::new(String::new()));
    let stderr_buf = Arc::new(StdMutex::new(String::new()));

    let script_error = Python::with_gil(|py| -> Result<Option<String>, ExecutorError> {
        let thread_id: u64 = py
            .import_bound("threading")
            .and_then(|threading| threading.call_method0("get_ident")?.extract())
            .map_err(bridge_fault)?;
        RUN_THREAD.store(thread_id, Ordering::SeqCst);

        let sys = py.import_bound("sys").map_err(bridge_fault)?;
        let old_stdout = sys.getattr("stdout").map_err(bridge_fault)?;
        let old_stderr = sys.getattr("stderr").map_err(bridge_fault)?;

        let out_writer = Bound::new(
            py,
            CaptureWriter {
                stream: StreamKind::Stdout,
                buffer: Arc::clone(&stdout_buf),
            },
        )
        .map_err(bridge_fault)?;
        let err_writer = Bound::new(
            py,
            CaptureWriter {
                stream: StreamKind::Stderr,
                buffer: Arc::clone(&stderr_buf),
            },
        )
        .map_err(bridge_fault)?;
        sys.setattr("stdout", &out_writer)
            .map_err(bridge_fault)?;
        sys.setattr("stderr", &err_writer)
            .map_err(bridge_fault)?;

        // Fresh top-level namespace per call; only the interpreter's own
        // module caching persists across runs.
        let run_outcome = py.import_bound("builtins").and_then(|builtins| {
            let globals = PyDict::new_bound(py);
            globals.set_item("__builtins__", builtins)?;
            py.run_bound(code, Some(&globals), Some(&globals))
        });

        // Restore the prior sinks before surfacing anything.
        let restored_out = sys.setattr("stdout", old_stdout);
        let restored_err = sys.setattr("stderr", old_stderr);

        let script_error = match run_outcome {
            Ok(()) => None,
            Err(err) => Some(format_script_error(py, &err)),
        };
        restored_out.map_err(bridge_fault)?;
        restored_err.map_err(bridge_fault)?;
        Ok(script_error)
    })?;

    let stdout = take_buffer(&stdout_buf);
    let mut stderr = take_buffer(&stderr_buf);
    let exit_code = match script_error {
        None => Some(0),
        Some(text) => {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&text);
            stderr.push('\n');
            Some(1)
        }
    };

    Ok(ExecutionResult {
        stdout,
        stderr,
        exit_code,
    })
}

fn take_buffer(buffer: &Arc<StdMutex<String>>) -> String {
    match buffer.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => String::new(),
    }
}

fn bridge_fault(err: PyErr) -> ExecutorError {
    ExecutorError::ExecutionFailed(format!("native bridge fault: {}", err))
}

/// Renders a script error as text. A full traceback when the interpreter can
/// produce one, the exception's repr otherwise.
fn format_script_error(py: Python<'_>, err: &PyErr) -> String {
    let traceback = py.import_bound("traceback").ok().and_then(|tb| {
        tb.call_method1(
            "format_exception",
            (
                err.get_type_bound(py),
                err.value_bound(py).clone(),
                err.traceback_bound(py),
            ),
        )
        .ok()
        .and_then(|lines| lines.extract::<Vec<String>>().ok())
        .map(|lines| lines.concat())
    });
    match traceback {
        Some(text) => text.trim_end().to_string(),
        None => err.to_string(),
    }
}
