//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Port publishing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host. `None` lets the runtime pick an ephemeral port.
    pub host_port: Option<u16>,
    /// Port in the container.
    pub container_port: u16,
    /// Protocol (tcp or udp).
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    /// Publish `container_port` on a runtime-assigned host port.
    pub fn ephemeral(container_port: u16) -> Self {
        Self {
            host_port: None,
            container_port,
            protocol: default_protocol(),
        }
    }

    /// Render as a `-p` argument.
    pub(crate) fn to_arg(&self) -> String {
        match self.host_port {
            Some(host) => format!("{}:{}/{}", host, self.container_port, self.protocol),
            None => format!("{}/{}", self.container_port, self.protocol),
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Allocate a TTY (`-t`).
    pub tty: bool,
    /// Keep STDIN open (`-i`).
    pub stdin_open: bool,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// This should be called before creating a container to ensure all inputs
    /// are well-formed before they reach the runtime command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the command to run.
    pub fn command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Run with an interactive TTY (`-i -t`), as a long-lived shell host.
    pub fn interactive_tty(mut self) -> Self {
        self.tty = true;
        self.stdin_open = true;
        self
    }
}

/// Container resource statistics as printed by `stats --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStats {
    /// Container ID.
    #[serde(default, alias = "ContainerID", alias = "Container", alias = "id")]
    pub container_id: String,

    /// Container name.
    #[serde(default, alias = "name")]
    pub name: String,

    /// CPU percentage.
    #[serde(default, alias = "CPUPerc", alias = "CPU", alias = "cpu_percent")]
    pub cpu_percent: String,

    /// Memory usage, e.g. `"12.5MiB / 1.944GiB"`.
    #[serde(default, alias = "mem_usage")]
    pub mem_usage: String,

    /// Memory percentage.
    #[serde(default, alias = "MemPerc", alias = "mem_percent")]
    pub mem_percent: String,

    /// Number of PIDs.
    #[serde(default, alias = "PIDs", alias = "pids")]
    pub pids: String,
}

/// Point-in-time memory usage of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Bytes in use.
    pub mem_usage: u64,
    /// Memory limit in bytes.
    pub mem_limit: u64,
    /// Usage as a percentage of the limit, rounded to two decimals.
    pub mem_pct: f64,
}

impl ContainerStats {
    /// Parse the `"<usage> / <limit>"` memory column into a snapshot.
    pub fn memory_snapshot(&self) -> ContainerResult<MemorySnapshot> {
        let (usage, limit) = self.mem_usage.split_once('/').ok_or_else(|| {
            ContainerError::ParseError(format!("unexpected memory column '{}'", self.mem_usage))
        })?;
        let mem_usage = parse_size(usage)?;
        // A zero limit would divide by zero; the runtime reports 0 when unlimited.
        let mem_limit = parse_size(limit)?.max(1);
        let pct = (mem_usage as f64 / mem_limit as f64) * 100.0;

        Ok(MemorySnapshot {
            mem_usage,
            mem_limit,
            mem_pct: (pct * 100.0).round() / 100.0,
        })
    }
}

/// Parse a human-readable size such as `1.5MiB`, `512kB` or `0B` into bytes.
pub(crate) fn parse_size(text: &str) -> ContainerResult<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| ContainerError::ParseError(format!("invalid size '{}'", text)))?;

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(ContainerError::ParseError(format!(
                "unknown size unit '{}'",
                other
            )));
        }
    };

    Ok((value * multiplier).round() as u64)
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Container names must be alphanumeric with hyphens and underscores.
/// They must start with an alphanumeric character or underscore.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate a label key (reverse-DNS style, e.g. `labterm.session`).
fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "label key cannot be empty".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}
