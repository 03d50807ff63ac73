//! Sandboxed execution backend.
//!
//! Hosts an interpreter inside an isolated, message-driven container (a child
//! process in this implementation) and presents it as a [`ScriptExecutor`]
//! despite the inherently asynchronous container protocol. Each call gets a
//! fresh request id and a pending continuation in a correlation map; the
//! dispatcher resolves the continuation exactly once when the matching
//! `result` or `error` message arrives. The hosted container is effectively
//! single-threaded, so only one call is usually in flight; the map makes the
//! routing explicit and keeps concurrent callers from ever seeing each
//! other's results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use super::container::{
    escape_for_dispatch, resolve_bootstrap, resolve_interpreter, ContainerHandle,
    ContainerMessage, ProcessContainer,
};
use super::{ExecutionRequest, ExecutionResult, ScriptExecutor};
use crate::config::RuntimeConfig;
use crate::errors::ExecutorError;

/// Boot state of the hosted interpreter. Transitions are one-way:
/// `Booting -> Ready` or `Booting -> Failed`.
#[derive(Debug, Clone)]
enum ReadyState {
    Booting,
    Ready,
    Failed(String),
}

type PendingReply = Result<ExecutionResult, ExecutorError>;
type PendingMap = Mutex<HashMap<Uuid, oneshot::Sender<PendingReply>>>;

pub struct SandboxExecutor {
    container: Arc<dyn ContainerHandle>,
    pending: Arc<PendingMap>,
    ready: watch::Receiver<ReadyState>,
    ready_timeout: Duration,
}

impl SandboxExecutor {
    /// Boots the real container: resolves the hosted interpreter and the
    /// bootstrap program, spawns the process, and starts the dispatcher.
    pub fn spawn(config: &RuntimeConfig) -> Result<Self, ExecutorError> {
        let interpreter = resolve_interpreter(config).ok_or_else(|| {
            ExecutorError::RuntimeUnavailable(
                "no hosted interpreter found for the sandbox container".to_string(),
            )
        })?;
        let bootstrap = resolve_bootstrap(config)?;
        log::info!(
            "booting sandbox container: {} {}",
            interpreter.display(),
            bootstrap.display()
        );
        let (container, messages) = ProcessContainer::spawn(&interpreter, &bootstrap)?;
        Ok(Self::with_container(
            container,
            messages,
            config.sandbox_ready_timeout(),
        ))
    }

    /// Wires an executor to an already-running container. The message stream
    /// must deliver every message the container emits, in order.
    pub fn with_container(
        container: Arc<dyn ContainerHandle>,
        messages: mpsc::UnboundedReceiver<ContainerMessage>,
        ready_timeout: Duration,
    ) -> Self {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Booting);
        tokio::spawn(dispatch_messages(messages, Arc::clone(&pending), ready_tx));
        Self {
            container,
            pending,
            ready: ready_rx,
            ready_timeout,
        }
    }

    /// Resolves once the container is ready, its boot has failed, or the
    /// deadline elapses, whichever happens first.
    async fn wait_ready(&self) -> Result<(), ExecutorError> {
        let mut ready = self.ready.clone();
        let wait = async {
            loop {
                let state = ready.borrow_and_update().clone();
                match state {
                    ReadyState::Ready => return Ok(()),
                    ReadyState::Failed(message) => {
                        return Err(ExecutorError::RuntimeUnavailable(format!(
                            "sandbox boot failed: {}",
                            message
                        )))
                    }
                    ReadyState::Booting => {}
                }
                if ready.changed().await.is_err() {
                    return Err(ExecutorError::RuntimeUnavailable(
                        "sandbox container terminated during boot".to_string(),
                    ));
                }
            }
        };
        match tokio::time::timeout(self.ready_timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutorError::RuntimeUnavailable(format!(
                "sandbox did not become ready within {:?}",
                self.ready_timeout
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl ScriptExecutor for SandboxExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.wait_ready().await?;

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let escaped = escape_for_dispatch(request.code());
        if let Err(err) = self.container.invoke_run(&escaped, id).await {
            // Dispatch itself failed: resolve immediately instead of leaving
            // the continuation pending forever.
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(ExecutorError::TransportFailed(
                "sandbox response channel closed".to_string(),
            )),
        }
    }
}

/// Consumes the container message stream for the lifetime of the container:
/// latches the ready/failed boot state and routes results to their pending
/// continuations. When the stream closes the container is gone, so every
/// orphaned continuation is resolved with a transport failure.
async fn dispatch_messages(
    mut messages: mpsc::UnboundedReceiver<ContainerMessage>,
    pending: Arc<PendingMap>,
    ready: watch::Sender<ReadyState>,
) {
    while let Some(message) = messages.recv().await {
        match message {
            ContainerMessage::Ready => {
                if matches!(*ready.borrow(), ReadyState::Booting) {
                    log::info!("sandbox container is ready");
                    let _ = ready.send(ReadyState::Ready);
                }
            }
            ContainerMessage::Result {
                id,
                stdout,
                stderr,
                exit_code,
            } => {
                resolve_pending(
                    &pending,
                    id,
                    Ok(ExecutionResult {
                        stdout,
                        stderr,
                        exit_code,
                    }),
                )
                .await;
            }
            ContainerMessage::Error {
                id: Some(id),
                message,
            } => {
                resolve_pending(&pending, id, Err(ExecutorError::ExecutionFailed(message)))
                    .await;
            }
            ContainerMessage::Error { id: None, message } => {
                if matches!(*ready.borrow(), ReadyState::Booting) {
                    log::error!("sandbox boot failed: {}", message);
                    let _ = ready.send(ReadyState::Failed(message));
                } else {
                    log::warn!("unroutable sandbox error: {}", message);
                }
            }
        }
    }

    if matches!(*ready.borrow(), ReadyState::Booting) {
        let _ = ready.send(ReadyState::Failed(
            "container terminated before signaling ready".to_string(),
        ));
    }
    let orphans: Vec<_> = pending.lock().await.drain().collect();
    for (id, tx) in orphans {
        log::warn!("sandbox request {} orphaned by container shutdown", id);
        let _ = tx.send(Err(ExecutorError::TransportFailed(
            "container terminated before responding".to_string(),
        )));
    }
}

/// Removes and resolves the pending continuation for `id`, at most once.
async fn resolve_pending(pending: &PendingMap, id: Uuid, reply: PendingReply) {
    match pending.lock().await.remove(&id) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => log::warn!("no pending request for sandbox response {}", id),
    }
}
