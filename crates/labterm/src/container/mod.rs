//! Container runtime management module.
//!
//! Provides an async interface to manage containers via Docker or Podman CLI.
//! The runtime is auto-detected or can be configured explicitly. Every
//! component receives the runtime as an explicit `Arc<dyn ContainerRuntimeApi>`
//! so tests can substitute a fake.

mod channel;
mod container;
mod error;
mod pty;

pub use channel::{ChannelCloser, ExecChannel};
pub use container::{ContainerConfig, ContainerStats, MemorySnapshot, PortMapping};
pub use container::{validate_container_name, validate_image_name};
pub use error::{ContainerError, ContainerResult};

use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use pty::PendingExec;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
    /// Execs created but not yet started, keyed by exec id.
    pending_execs: Arc<Mutex<HashMap<String, PendingExec>>>,
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Whether an image with this tag exists locally.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;

    /// Build an image from a context directory and build file, tagging it.
    async fn build_image(&self, context: &Path, dockerfile: &Path, tag: &str)
    -> ContainerResult<()>;

    /// Create and start a detached container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// State status string (e.g. "running", "exited"); `None` when missing.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;

    /// Prepare an interactive, TTY-backed exec. Returns an exec id.
    async fn exec_create(&self, container_id: &str, command: &[String]) -> ContainerResult<String>;

    /// Start a previously created exec and return its live channel.
    async fn exec_start(&self, exec_id: &str) -> ContainerResult<ExecChannel>;

    /// Run a command to completion and return stdout followed by stderr.
    async fn exec_capture(&self, container_id: &str, command: &[String])
    -> ContainerResult<Vec<u8>>;

    /// Single stats snapshot.
    async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats>;
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        self.image_exists(image).await
    }

    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
    ) -> ContainerResult<()> {
        self.build_image(context, dockerfile, tag).await
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        self.container_state_status(id_or_name).await
    }

    async fn exec_create(&self, container_id: &str, command: &[String]) -> ContainerResult<String> {
        self.exec_create(container_id, command).await
    }

    async fn exec_start(&self, exec_id: &str) -> ContainerResult<ExecChannel> {
        self.exec_start(exec_id).await
    }

    async fn exec_capture(
        &self,
        container_id: &str,
        command: &[String],
    ) -> ContainerResult<Vec<u8>> {
        self.exec_capture(container_id, command).await
    }

    async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        self.get_stats(container_id).await
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, then Podman. Falls back to docker (and fails at call
    /// time) when neither binary is on PATH.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self::with_binary(runtime_type, runtime_type.default_binary())
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            pending_execs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Path of the CLI binary in use.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the CLI with `args`, capturing output. Spawn failures become
    /// `CommandFailed`; the exit status is left to the caller.
    async fn run_cli<I, S>(&self, command: &str, args: I) -> ContainerResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run the CLI and fail on a non-zero exit.
    async fn run_checked<I, S>(&self, command: &str, target: &str, args: I) -> ContainerResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.run_cli(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(command, target, &stderr));
        }
        Ok(output)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self
            .run_checked("version", "", ["version", "--format", "json"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect` (works for both Docker and Podman).
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let output = self.run_cli("image inspect", ["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    /// Build an image and tag it.
    pub async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
    ) -> ContainerResult<()> {
        validate_image_name(tag)?;
        if !context.is_dir() {
            return Err(ContainerError::InvalidInput(format!(
                "build context {} is not a directory",
                context.display()
            )));
        }

        let args: Vec<&std::ffi::OsStr> = vec![
            "build".as_ref(),
            "--rm".as_ref(),
            "-t".as_ref(),
            tag.as_ref(),
            "-f".as_ref(),
            dockerfile.as_os_str(),
            context.as_os_str(),
        ];
        self.run_checked("build", tag, args).await?;
        Ok(())
    }

    /// Create and start a new container.
    ///
    /// The configuration is validated before creating the container so that
    /// only well-formed values reach the command line.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut owned_args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        if config.stdin_open {
            owned_args.push("-i".to_string());
        }
        if config.tty {
            owned_args.push("-t".to_string());
        }

        for port in &config.ports {
            owned_args.push("-p".to_string());
            owned_args.push(port.to_arg());
        }

        for (key, value) in &config.labels {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        owned_args.push(config.image.clone());
        owned_args.extend(config.command.iter().cloned());

        let target = config.name.as_deref().unwrap_or(&config.image);
        let output = self.run_checked("run", target, &owned_args).await?;

        // Return container ID (trimmed)
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stop a running container.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut owned_args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout {
            owned_args.push("-t".to_string());
            owned_args.push(t.to_string());
        }
        owned_args.push(container_id.to_string());

        self.run_checked("stop", container_id, &owned_args).await?;
        Ok(())
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        self.run_checked("rm", container_id, args).await?;
        Ok(())
    }

    /// Get the container state status string (e.g. "running", "exited") via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        let output = self
            .run_cli(
                "inspect",
                ["inspect", "--format", "{{.State.Status}}", id_or_name],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return match ContainerError::from_stderr("inspect", id_or_name, &stderr) {
                ContainerError::ContainerNotFound(_) => Ok(None),
                other => Err(other),
            };
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status))
    }

    /// Allocate a PTY for an interactive exec and remember it under a new id.
    pub async fn exec_create(
        &self,
        container_id: &str,
        command: &[String],
    ) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;
        if command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let exec_id = format!("exec-{}", uuid::Uuid::new_v4().simple());
        let pending = pty::allocate(container_id, command, &exec_id)?;
        self.pending_execs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(exec_id.clone(), pending);
        debug!("created exec {} for {}", exec_id, container_id);
        Ok(exec_id)
    }

    /// Spawn the exec client for a created exec.
    pub async fn exec_start(&self, exec_id: &str) -> ContainerResult<ExecChannel> {
        let pending = self
            .pending_execs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(exec_id)
            .ok_or_else(|| ContainerError::ExecNotFound(exec_id.to_string()))?;
        debug!(
            "starting exec {} in {}: {:?}",
            exec_id, pending.container, pending.command
        );
        pty::start(&self.binary, pending)
    }

    /// Execute a command in a container and return its output.
    ///
    /// This runs `exec` without a TTY and waits for the command to complete.
    /// The exit code is not interpreted: validator scripts report through
    /// their output and may exit non-zero.
    pub async fn exec_capture(
        &self,
        container_id: &str,
        command: &[String],
    ) -> ContainerResult<Vec<u8>> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<&str> = vec!["exec", container_id];
        args.extend(command.iter().map(String::as_str));

        let output = self.run_cli("exec", args).await?;
        let mut captured = output.stdout;
        captured.extend_from_slice(&output.stderr);
        Ok(captured)
    }

    /// Get container stats (single snapshot).
    ///
    /// Podman prints a JSON array, Docker one JSON object per line.
    pub async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        validate_container_id_or_name(container_id)?;

        let output = self
            .run_checked(
                "stats",
                container_id,
                ["stats", "--no-stream", "--format", "json", container_id],
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_stats(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
    }
}

fn parse_stats(stdout: &str) -> ContainerResult<Vec<ContainerStats>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}
