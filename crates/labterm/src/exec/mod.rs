//! Exec attacher: opens interactive or one-shot processes inside a sandbox.

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::container::{ContainerError, ContainerRuntimeApi, ExecChannel};

/// Interactive shell started on attach.
pub const DEFAULT_SHELL: &[&str] = &["/bin/bash", "-i"];

pub type AttachResult<T> = Result<T, AttachError>;

/// Why an exec could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("Container '{0}' not found")]
    SandboxNotFound(String),

    #[error("Container '{name}' is not running (status: {status})")]
    SandboxNotRunning { name: String, status: String },

    #[error("Error creating exec: {0}")]
    ExecCreateFailed(String),

    #[error("Error starting exec: {0}")]
    ExecStartFailed(String),

    /// Inspecting the sandbox failed for a reason other than absence.
    #[error("Error getting container: {0}")]
    Runtime(String),
}

impl AttachError {
    pub fn is_sandbox_gone(&self) -> bool {
        matches!(self, AttachError::SandboxNotFound(_))
    }
}

/// Attaches processes to running sandboxes through the runtime handle.
#[derive(Clone)]
pub struct ExecAttacher {
    runtime: Arc<dyn ContainerRuntimeApi>,
}

impl ExecAttacher {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self { runtime }
    }

    /// Fails unless the sandbox exists and is running.
    pub async fn ensure_running(&self, container: &str) -> AttachResult<()> {
        match self.runtime.container_state_status(container).await {
            Ok(Some(status)) if status == "running" => Ok(()),
            Ok(Some(status)) => Err(AttachError::SandboxNotRunning {
                name: container.to_string(),
                status,
            }),
            Ok(None) => Err(AttachError::SandboxNotFound(container.to_string())),
            Err(e) if e.is_not_found() => Err(AttachError::SandboxNotFound(container.to_string())),
            Err(e) => Err(AttachError::Runtime(e.to_string())),
        }
    }

    /// Open an interactive, PTY-backed process and return its channel.
    pub async fn open_interactive(
        &self,
        container: &str,
        command: &[String],
    ) -> AttachResult<ExecChannel> {
        self.ensure_running(container).await?;

        let exec_id = self
            .runtime
            .exec_create(container, command)
            .await
            .map_err(|e| AttachError::ExecCreateFailed(e.to_string()))?;
        debug!("exec {} created in {}", exec_id, container);

        self.runtime
            .exec_start(&exec_id)
            .await
            .map_err(|e| AttachError::ExecStartFailed(e.to_string()))
    }

    /// Run a command to completion, returning stdout followed by stderr.
    pub async fn run_captured(&self, container: &str, command: &[String]) -> AttachResult<Vec<u8>> {
        self.ensure_running(container).await?;

        self.runtime
            .exec_capture(container, command)
            .await
            .map_err(|e| match e {
                ContainerError::ContainerNotFound(_) => {
                    AttachError::SandboxNotFound(container.to_string())
                }
                other => AttachError::ExecStartFailed(other.to_string()),
            })
    }
}

impl std::fmt::Debug for ExecAttacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecAttacher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRuntime;

    fn shell() -> Vec<String> {
        DEFAULT_SHELL.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn not_running_reports_status() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_status("lab01_s1", "exited");
        let attacher = ExecAttacher::new(runtime.clone());

        let err = attacher.open_interactive("lab01_s1", &shell()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Container 'lab01_s1' is not running (status: exited)"
        );
        assert_eq!(runtime.exec_creates(), 0);
    }

    #[tokio::test]
    async fn missing_sandbox() {
        let runtime = Arc::new(FakeRuntime::new());
        let attacher = ExecAttacher::new(runtime);

        let err = attacher.open_interactive("lab01_gone", &shell()).await.unwrap_err();
        assert!(err.is_sandbox_gone());
        assert_eq!(err.to_string(), "Container 'lab01_gone' not found");
    }

    #[tokio::test]
    async fn inspect_failure_is_runtime_error() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_inspect("daemon unavailable");
        let attacher = ExecAttacher::new(runtime);

        let err = attacher.open_interactive("lab01_s1", &shell()).await.unwrap_err();
        assert!(matches!(err, AttachError::Runtime(_)));
        assert!(err.to_string().starts_with("Error getting container:"));
    }

    #[tokio::test]
    async fn create_and_start_failures_are_distinct() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_status("lab01_s1", "running");
        runtime.fail_exec_create("no pty");
        let attacher = ExecAttacher::new(runtime.clone());
        let err = attacher.open_interactive("lab01_s1", &shell()).await.unwrap_err();
        assert!(matches!(err, AttachError::ExecCreateFailed(_)));

        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_status("lab01_s1", "running");
        runtime.fail_exec_start("spawn failed");
        let attacher = ExecAttacher::new(runtime);
        let err = attacher.open_interactive("lab01_s1", &shell()).await.unwrap_err();
        assert!(matches!(err, AttachError::ExecStartFailed(_)));
    }

    #[tokio::test]
    async fn interactive_attach_uses_command() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_status("lab01_s1", "running");
        let attacher = ExecAttacher::new(runtime.clone());

        attacher.open_interactive("lab01_s1", &shell()).await.unwrap();
        assert_eq!(runtime.last_exec_command(), Some(shell()));
    }

    #[tokio::test]
    async fn captured_output_is_returned() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_status("lab01_s1", "running");
        runtime.set_capture_output(b"PASS: service restarted\n");
        let attacher = ExecAttacher::new(runtime);

        let cmd = vec!["/bin/true".to_string()];
        let out = attacher.run_captured("lab01_s1", &cmd).await.unwrap();
        assert_eq!(out, b"PASS: service restarted\n");
    }
}
