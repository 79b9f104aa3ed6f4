//! Session service: the lifecycle operations behind the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use log::{debug, info, warn};

use crate::bridge::{self, BridgeReport, Notice, TerminalBridge};
use crate::container::{ContainerRuntimeApi, MemorySnapshot, validate_container_name};
use crate::exec::{DEFAULT_SHELL, ExecAttacher};
use crate::provision::{ProvisionError, Provisioner, ProvisionerConfig, validate_lab_id};

use super::error::{LifecycleError, LifecycleResult};
use super::models::{CreatedSession, Session};
use super::registry::{Reconcile, SessionRegistry};

/// Default validator run by `validate`.
const DEFAULT_VALIDATOR: &[&str] = &["/bin/bash", "/opt/validator/validator.sh"];

/// Configuration for the session service.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Directory with one build context per lab.
    pub labs_dir: PathBuf,
    /// Image used when a lab image is unavailable.
    pub fallback_image: String,
    /// Interactive shell for terminals.
    pub shell_command: Vec<String>,
    /// Command whose output is the validation result.
    pub validator_command: Vec<String>,
    /// How long `create` waits for provisioning.
    pub provision_timeout: Duration,
    /// Grace period for stopping a sandbox, in seconds.
    pub stop_timeout_secs: u32,
    /// How long `destroy` waits for a live bridge to tear down.
    pub bridge_shutdown_timeout: Duration,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        let provisioner = ProvisionerConfig::default();
        Self {
            labs_dir: provisioner.labs_dir,
            fallback_image: provisioner.fallback_image,
            shell_command: DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
            validator_command: DEFAULT_VALIDATOR.iter().map(|s| s.to_string()).collect(),
            provision_timeout: Duration::from_secs(5),
            stop_timeout_secs: 2,
            bridge_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Session lifecycle service.
#[derive(Clone)]
pub struct SessionService {
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    provisioner: Provisioner,
    attacher: ExecAttacher,
    config: Arc<SessionServiceConfig>,
}

impl SessionService {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: SessionServiceConfig) -> Self {
        let provisioner = Provisioner::new(
            runtime.clone(),
            ProvisionerConfig {
                labs_dir: config.labs_dir.clone(),
                fallback_image: config.fallback_image.clone(),
            },
        );
        Self {
            registry: Arc::new(SessionRegistry::new()),
            attacher: ExecAttacher::new(runtime.clone()),
            runtime,
            provisioner,
            config: Arc::new(config),
        }
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.registry.get(key)
    }

    pub fn list(&self) -> Vec<Session> {
        self.registry.list()
    }

    /// Create a session and wait a bounded time for its sandbox.
    ///
    /// Provisioning runs as its own task. When the wait times out the task
    /// keeps going and records its result in the registry later.
    pub async fn create(&self, lab_id: &str) -> LifecycleResult<CreatedSession> {
        validate_lab_id(lab_id).map_err(|_| LifecycleError::InvalidLab(lab_id.to_string()))?;

        let session_id = self.registry.insert_creating(lab_id);
        info!("creating session {} for lab {}", session_id, lab_id);

        let task = tokio::spawn({
            let service = self.clone();
            let lab_id = lab_id.to_string();
            let session_id = session_id.clone();
            async move { service.provision_and_reconcile(&lab_id, &session_id).await }
        });

        match tokio::time::timeout(self.config.provision_timeout, task).await {
            Ok(Ok(Ok(container_name))) => Ok(CreatedSession {
                session_id,
                container_name,
                lab_id: lab_id.to_string(),
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_error)) => {
                self.registry.fail_provisioning(&session_id);
                Err(LifecycleError::ProvisionFailed {
                    session_id,
                    source: ProvisionError::Aborted(join_error.to_string()),
                })
            }
            Err(_) => {
                warn!(
                    "session {} still provisioning after {:?}",
                    session_id, self.config.provision_timeout
                );
                Err(LifecycleError::ProvisionTimeout { session_id })
            }
        }
    }

    async fn provision_and_reconcile(
        &self,
        lab_id: &str,
        session_id: &str,
    ) -> LifecycleResult<String> {
        match self.provisioner.provision(lab_id, session_id).await {
            Ok(container_name) => match self
                .registry
                .complete_provisioning(session_id, &container_name)
            {
                Reconcile::Applied => {
                    info!("session {} ready in {}", session_id, container_name);
                    Ok(container_name)
                }
                Reconcile::Discard => {
                    info!(
                        "session {} closed while provisioning, releasing {}",
                        session_id, container_name
                    );
                    self.release_sandbox(&container_name).await;
                    Err(LifecycleError::SessionClosed(session_id.to_string()))
                }
            },
            Err(e) => {
                warn!("provisioning session {} failed: {}", session_id, e);
                self.registry.fail_provisioning(session_id);
                Err(LifecycleError::ProvisionFailed {
                    session_id: session_id.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Destroy a session by id or container name. Never fails.
    ///
    /// An unknown key is taken to be a container name and removed if present.
    pub async fn destroy(&self, key: &str) {
        let container_name = match self.registry.begin_close(key) {
            Some(closing) => {
                if let Some(bridge) = closing.bridge {
                    bridge.cancel.cancel();
                    let wait = tokio::time::timeout(
                        self.config.bridge_shutdown_timeout,
                        bridge.finished.cancelled(),
                    );
                    if wait.await.is_err() {
                        warn!("terminal of session {} did not close in time", closing.session_id);
                    }
                }
                info!(
                    "closed session {} (was {})",
                    closing.session_id, closing.previous
                );
                closing.container_name
            }
            None if validate_container_name(key).is_ok() => {
                debug!("no session for {}, removing it as a container", key);
                Some(key.to_string())
            }
            None => None,
        };

        if let Some(name) = container_name {
            self.release_sandbox(&name).await;
        }
    }

    /// Stop and force-remove a sandbox; a missing container is fine.
    async fn release_sandbox(&self, container_name: &str) {
        match self
            .runtime
            .stop_container(container_name, Some(self.config.stop_timeout_secs))
            .await
        {
            Ok(()) => debug!("stopped {}", container_name),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to stop {}: {}", container_name, e),
        }
        match self.runtime.remove_container(container_name, true).await {
            Ok(()) => info!("removed sandbox {}", container_name),
            Err(e) if e.is_not_found() => debug!("sandbox {} already gone", container_name),
            Err(e) => warn!("failed to remove {}: {}", container_name, e),
        }
    }

    /// Container of a session whose sandbox can run commands.
    fn running_sandbox(&self, key: &str) -> LifecycleResult<String> {
        let Some(session) = self.registry.get(key) else {
            return Err(match self.registry.state(key) {
                Some(state) => LifecycleError::NotReady {
                    session_id: key.to_string(),
                    state,
                },
                None => LifecycleError::UnknownSession(key.to_string()),
            });
        };
        match session.container_name {
            Some(name) if session.state.has_sandbox() => Ok(name),
            _ => Err(LifecycleError::NotReady {
                session_id: session.id,
                state: session.state,
            }),
        }
    }

    /// Run the validator in the session's sandbox and return its output.
    pub async fn validate(&self, key: &str) -> LifecycleResult<String> {
        let container_name = self.running_sandbox(key)?;
        let output = self
            .attacher
            .run_captured(&container_name, &self.config.validator_command)
            .await
            .map_err(|e| LifecycleError::SandboxUnreachable(e.to_string()))?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// One-shot memory usage of a session's sandbox.
    pub async fn memory_snapshot(&self, key: &str) -> LifecycleResult<MemorySnapshot> {
        let container_name = self.running_sandbox(key)?;
        self.runtime
            .get_stats(&container_name)
            .await
            .and_then(|stats| stats.memory_snapshot())
            .map_err(|e| LifecycleError::SandboxUnreachable(e.to_string()))
    }

    /// Attach a terminal client to a session and serve it until it closes.
    ///
    /// Returns `None` when the registry rejected the attach.
    pub async fn serve_terminal<Si, St, E>(
        &self,
        key: &str,
        sink: Si,
        stream: St,
    ) -> Option<BridgeReport>
    where
        Si: Sink<Message> + Unpin,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: std::fmt::Display,
    {
        let ticket = match self.registry.begin_attach(key) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("terminal for {} rejected: {}", key, e);
                bridge::reject(sink, Notice::from(&e)).await;
                return None;
            }
        };
        let _finished = ticket.finished.clone().drop_guard();
        let session_id = ticket.session_id;

        let bridge = TerminalBridge::new(
            session_id.clone(),
            ticket.container_name,
            self.config.shell_command.clone(),
            self.attacher.clone(),
            ticket.cancel,
        );
        let report = bridge.run(sink, stream).await;
        self.registry
            .finish_attach(&session_id, report.sandbox_gone());
        Some(report)
    }

    /// Destroy every session still in the registry.
    pub async fn shutdown_all(&self) {
        let ids = self.registry.live_ids();
        if ids.is_empty() {
            return;
        }
        info!("shutting down {} session(s)", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.destroy(id))).await;
    }
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
