use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::container::{ContainerHandle, ContainerMessage};
use super::sandbox::SandboxExecutor;
use super::{ExecutionRequest, ScriptExecutor};
use crate::config::RuntimeConfig;
use crate::errors::ExecutorError;

/// How the scripted container reacts to a run call.
enum Behavior {
    /// Reply with a result whose stdout echoes the dispatched code.
    Echo,
    /// Reply with an error message addressed to the request id.
    ErrorReply,
    /// Fail synchronously, as if the call could not even be queued.
    FailDispatch,
    /// Swallow the call and never answer.
    Silent,
}

/// Scripted stand-in for the container process.
struct FakeContainer {
    messages: Option<mpsc::UnboundedSender<ContainerMessage>>,
    behavior: Behavior,
}

#[async_trait]
impl ContainerHandle for FakeContainer {
    async fn invoke_run(&self, escaped_code: &str, id: Uuid) -> Result<(), ExecutorError> {
        let reply = match self.behavior {
            Behavior::Echo => ContainerMessage::Result {
                id,
                stdout: format!("{}\n", escaped_code),
                stderr: String::new(),
                exit_code: Some(0),
            },
            Behavior::ErrorReply => ContainerMessage::Error {
                id: Some(id),
                message: "interpreter exploded".to_string(),
            },
            Behavior::FailDispatch => {
                return Err(ExecutorError::TransportFailed(
                    "entry point rejected the call".to_string(),
                ))
            }
            Behavior::Silent => return Ok(()),
        };
        self.messages
            .as_ref()
            .and_then(|tx| tx.send(reply).ok())
            .ok_or_else(|| ExecutorError::TransportFailed("message stream closed".to_string()))?;
        Ok(())
    }
}

fn executor_with(
    behavior: Behavior,
    ready_timeout: Duration,
) -> (SandboxExecutor, mpsc::UnboundedSender<ContainerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let container = Arc::new(FakeContainer {
        messages: Some(tx.clone()),
        behavior,
    });
    (
        SandboxExecutor::with_container(container, rx, ready_timeout),
        tx,
    )
}

#[tokio::test]
async fn result_is_routed_to_the_caller() {
    let (executor, tx) = executor_with(Behavior::Echo, Duration::from_secs(5));
    tx.send(ContainerMessage::Ready).unwrap();

    let result = executor
        .execute(&ExecutionRequest::new("print('hi')"))
        .await
        .unwrap();
    assert_eq!(result.stdout, "print('hi')\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(executor.pending_len().await, 0);
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_result() {
    let (executor, tx) = executor_with(Behavior::Echo, Duration::from_secs(5));
    tx.send(ContainerMessage::Ready).unwrap();

    let executor = Arc::new(executor);
    let mut handles = Vec::new();
    for k in 0..8 {
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            let code = format!("task-{}", k);
            let result = executor
                .execute(&ExecutionRequest::new(code.as_str()))
                .await
                .unwrap();
            (code, result)
        }));
    }
    for handle in handles {
        let (code, result) = handle.await.unwrap();
        assert_eq!(result.stdout, format!("{}\n", code));
    }
    assert_eq!(executor.pending_len().await, 0);
}

#[tokio::test]
async fn execute_before_ready_fails_after_the_timeout() {
    let (executor, _tx) = executor_with(Behavior::Echo, Duration::from_millis(50));

    let err = executor
        .execute(&ExecutionRequest::new("print(1)"))
        .await
        .unwrap_err();
    match err {
        ExecutorError::RuntimeUnavailable(message) => {
            assert!(message.contains("ready"), "unexpected message: {}", message)
        }
        other => panic!("expected RuntimeUnavailable, got {:?}", other),
    }
    assert_eq!(executor.pending_len().await, 0);
}

#[tokio::test]
async fn late_ready_signal_still_resolves() {
    let (executor, tx) = executor_with(Behavior::Echo, Duration::from_secs(5));
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(ContainerMessage::Ready);
    });

    let result = executor
        .execute(&ExecutionRequest::new("print(1)"))
        .await
        .unwrap();
    assert!(result.success());
}

#[tokio::test]
async fn boot_error_latches_a_persistent_failure() {
    let (executor, tx) = executor_with(Behavior::Echo, Duration::from_secs(5));
    tx.send(ContainerMessage::Error {
        id: None,
        message: "asset fetch failed".to_string(),
    })
    .unwrap();

    for _ in 0..2 {
        let err = executor
            .execute(&ExecutionRequest::new("print(1)"))
            .await
            .unwrap_err();
        match err {
            ExecutorError::RuntimeUnavailable(message) => {
                assert!(message.contains("asset fetch failed"))
            }
            other => panic!("expected RuntimeUnavailable, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn failed_dispatch_resolves_immediately() {
    let (executor, tx) = executor_with(Behavior::FailDispatch, Duration::from_secs(5));
    tx.send(ContainerMessage::Ready).unwrap();

    let err = executor
        .execute(&ExecutionRequest::new("print(1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::TransportFailed(_)));
    assert_eq!(executor.pending_len().await, 0);
}

#[tokio::test]
async fn error_reply_resolves_the_matching_caller() {
    let (executor, tx) = executor_with(Behavior::ErrorReply, Duration::from_secs(5));
    tx.send(ContainerMessage::Ready).unwrap();

    let err = executor
        .execute(&ExecutionRequest::new("print(1)"))
        .await
        .unwrap_err();
    match err {
        ExecutorError::ExecutionFailed(message) => {
            assert_eq!(message, "interpreter exploded")
        }
        other => panic!("expected ExecutionFailed, got {:?}", other),
    }
}

#[tokio::test]
#[ignore] // Requires a Python interpreter on PATH
async fn real_container_round_trip() {
    let executor = SandboxExecutor::spawn(&RuntimeConfig::default()).unwrap();

    let result = executor
        .execute(&ExecutionRequest::new(
            "print('sandboxed')\nimport sys\nsys.stderr.write('warn')\n",
        ))
        .await
        .unwrap();
    assert_eq!(result.stdout, "sandboxed\n");
    assert_eq!(result.stderr, "warn");
    assert_eq!(result.exit_code, Some(0));

    let failure = executor
        .execute(&ExecutionRequest::new("1 / 0"))
        .await
        .unwrap();
    assert_eq!(failure.exit_code, Some(1));
    assert!(failure.stderr.contains("ZeroDivisionError"));
}

#[tokio::test]
async fn container_death_resolves_orphaned_requests() {
    let (tx, rx) = mpsc::unbounded_channel();
    let container = Arc::new(FakeContainer {
        messages: None,
        behavior: Behavior::Silent,
    });
    let executor = Arc::new(SandboxExecutor::with_container(
        container,
        rx,
        Duration::from_secs(5),
    ));
    tx.send(ContainerMessage::Ready).unwrap();

    let pending_run = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(&ExecutionRequest::new("print(1)")).await })
    };
    while executor.pending_len().await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The container dies: its message stream closes.
    drop(tx);

    let err = pending_run.await.unwrap().unwrap_err();
    match err {
        ExecutorError::TransportFailed(message) => {
            assert!(message.contains("terminated"), "unexpected: {}", message)
        }
        other => panic!("expected TransportFailed, got {:?}", other),
    }
    assert_eq!(executor.pending_len().await, 0);
}
