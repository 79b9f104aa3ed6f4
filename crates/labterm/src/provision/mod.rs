//! Sandbox provisioning: build-once lab images and detached lab containers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::container::{ContainerConfig, ContainerError, ContainerRuntimeApi, PortMapping};

/// Build definition file names, checked in order.
const BUILD_FILES: &[&str] = &["dockerfile", "Dockerfile"];

/// Port every lab container publishes to an ephemeral host port.
const LAB_PORT: u16 = 8080;

/// Keeps the sandbox alive; shells are attached with exec.
const KEEPALIVE_COMMAND: &[&str] = &["sleep", "infinity"];

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid lab id '{0}'")]
    InvalidLabId(String),

    /// Both the lab image and the fallback image failed.
    #[error("{}", failure_message(.primary.as_deref(), .fallback))]
    Failed {
        primary: Option<String>,
        fallback: String,
    },

    /// The provisioning task panicked or was cancelled.
    #[error("provisioning aborted: {0}")]
    Aborted(String),
}

fn failure_message(primary: Option<&str>, fallback: &str) -> String {
    match primary {
        Some(primary) => format!("lab image failed: {primary}; fallback image failed: {fallback}"),
        None => format!("fallback image failed: {fallback}"),
    }
}

/// Check a lab id before it is used as a path segment and image tag.
pub fn validate_lab_id(lab_id: &str) -> ProvisionResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if lab_id.is_empty()
        || lab_id.len() > 64
        || lab_id.starts_with('.')
        || !lab_id.chars().all(valid_chars)
    {
        return Err(ProvisionError::InvalidLabId(lab_id.to_string()));
    }
    Ok(())
}

/// Short container name prefix derived from a lab id.
///
/// `lab-01-3am-crash` becomes `lab01`.
pub fn container_prefix(lab_id: &str) -> String {
    let prefix: String = lab_id
        .split('-')
        .take(2)
        .flat_map(|segment| segment.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if prefix.is_empty() {
        "lab".to_string()
    } else {
        prefix
    }
}

pub fn container_name(lab_id: &str, session_id: &str) -> String {
    format!("{}_{}", container_prefix(lab_id), session_id)
}

/// Image tag for a lab's build context.
pub fn lab_image(lab_id: &str) -> String {
    format!("{}:latest", lab_id.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Directory holding one build context per lab.
    pub labs_dir: PathBuf,
    /// Image used when the lab image is missing or fails.
    pub fallback_image: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            labs_dir: PathBuf::from("labs"),
            fallback_image: "ubuntu:22.04".to_string(),
        }
    }
}

/// Creates one sandbox per session.
#[derive(Clone)]
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: ProvisionerConfig,
    /// One lock per image tag; held across the exists check and the build.
    build_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: ProvisionerConfig) -> Self {
        Self {
            runtime,
            config,
            build_locks: Arc::new(DashMap::new()),
        }
    }

    fn build_file(&self, lab_id: &str) -> Option<PathBuf> {
        let context = self.config.labs_dir.join(lab_id);
        BUILD_FILES
            .iter()
            .map(|file| context.join(file))
            .find(|path| path.is_file())
    }

    /// Provision a sandbox for `session_id` and return its container name.
    pub async fn provision(&self, lab_id: &str, session_id: &str) -> ProvisionResult<String> {
        validate_lab_id(lab_id)?;
        let name = container_name(lab_id, session_id);

        let primary = match self.build_file(lab_id) {
            Some(dockerfile) => match self
                .run_lab_image(lab_id, session_id, &dockerfile, &name)
                .await
            {
                Ok(()) => {
                    info!("sandbox {} started from {}", name, lab_image(lab_id));
                    return Ok(name);
                }
                Err(e) => {
                    warn!("lab image for {} failed, using fallback: {}", lab_id, e);
                    Some(e.to_string())
                }
            },
            None => {
                debug!(
                    "no build definition for {} under {}",
                    lab_id,
                    self.config.labs_dir.display()
                );
                None
            }
        };

        self.remove_partial(&name).await;

        let fallback = &self.config.fallback_image;
        match self.run_sandbox(fallback, &name, lab_id, session_id).await {
            Ok(()) => {
                info!("sandbox {} started from fallback {}", name, fallback);
                Ok(name)
            }
            Err(e) => {
                self.remove_partial(&name).await;
                Err(ProvisionError::Failed {
                    primary,
                    fallback: e.to_string(),
                })
            }
        }
    }

    async fn run_lab_image(
        &self,
        lab_id: &str,
        session_id: &str,
        dockerfile: &Path,
        name: &str,
    ) -> Result<(), ContainerError> {
        let image = lab_image(lab_id);
        self.ensure_image(lab_id, dockerfile, &image).await?;
        self.run_sandbox(&image, name, lab_id, session_id).await
    }

    /// Build `image` unless it exists. Concurrent callers for the same tag
    /// wait for the first build instead of starting their own.
    async fn ensure_image(
        &self,
        lab_id: &str,
        dockerfile: &Path,
        image: &str,
    ) -> Result<(), ContainerError> {
        let lock = self.build_locks.entry(image.to_string()).or_default().clone();
        let _build = lock.lock().await;

        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        let context = self.config.labs_dir.join(lab_id);
        info!("building image {} from {}", image, context.display());
        self.runtime.build_image(&context, dockerfile, image).await
    }

    async fn run_sandbox(
        &self,
        image: &str,
        name: &str,
        lab_id: &str,
        session_id: &str,
    ) -> Result<(), ContainerError> {
        let config = ContainerConfig::new(image)
            .name(name)
            .command(KEEPALIVE_COMMAND.iter().copied())
            .interactive_tty()
            .port(PortMapping::ephemeral(LAB_PORT))
            .label("labterm.lab", lab_id)
            .label("labterm.session", session_id);
        let id = self.runtime.create_container(&config).await?;
        debug!("container {} has id {}", name, id);
        Ok(())
    }

    /// Best-effort removal of a container that may have been half created.
    async fn remove_partial(&self, name: &str) {
        match self.runtime.remove_container(name, true).await {
            Ok(()) => debug!("removed partial container {}", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to remove partial container {}: {}", name, e),
        }
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
