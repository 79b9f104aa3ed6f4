//! PTY-backed interactive exec via the runtime CLI.
//!
//! `exec_create` allocates the pseudo-terminal, `exec_start` spawns
//! `<runtime> exec -it <container> <cmd>` on its slave side and hands back the
//! master side as an [`ExecChannel`]. Killing the CLI client closes the slave,
//! which makes a blocked master read return.
//!
//! Killing the client does not end the process inside the container, so the
//! command runs under a small `sh` wrapper that records its pid in a file in
//! the container. Shutdown sends that pid a `SIGHUP` with a second exec.

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};

use super::channel::{ChannelCloser, ExecChannel};
use super::error::{ContainerError, ContainerResult};

/// Initial terminal geometry for interactive shells.
const DEFAULT_SIZE: PtySize = PtySize {
    rows: 40,
    cols: 120,
    pixel_width: 0,
    pixel_height: 0,
};

/// Records the shell's pid in `$0`, then replaces itself with the command.
const PID_WRAPPER: &str = r#"{ echo $$ > "$0"; } 2>/dev/null; exec "$@""#;

/// Hangs up the pid recorded in `$0` and removes the file.
const HANGUP_SCRIPT: &str = r#"kill -HUP "$(cat "$0")" 2>/dev/null; rm -f "$0""#;

/// An exec that has been created but not yet started.
pub(crate) struct PendingExec {
    pub container: String,
    pub command: Vec<String>,
    pid_file: String,
    pair: PtyPair,
}

impl std::fmt::Debug for PendingExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExec")
            .field("container", &self.container)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Allocate a PTY for a future exec.
pub(crate) fn allocate(
    container: &str,
    command: &[String],
    exec_id: &str,
) -> ContainerResult<PendingExec> {
    let pair = native_pty_system()
        .openpty(DEFAULT_SIZE)
        .map_err(|e| ContainerError::Pty(format!("failed to open PTY: {e}")))?;

    Ok(PendingExec {
        container: container.to_string(),
        command: command.to_vec(),
        pid_file: format!("/tmp/.labterm-{exec_id}.pid"),
        pair,
    })
}

/// `command` wrapped so that its pid lands in `pid_file`.
fn wrapped_command(pid_file: &str, command: &[String]) -> Vec<String> {
    let mut argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        PID_WRAPPER.to_string(),
        pid_file.to_string(),
    ];
    argv.extend(command.iter().cloned());
    argv
}

fn hangup_command(pid_file: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        HANGUP_SCRIPT.to_string(),
        pid_file.to_string(),
    ]
}

/// Spawn the runtime's exec client on the pending PTY.
pub(crate) fn start(binary: &str, pending: PendingExec) -> ContainerResult<ExecChannel> {
    let PendingExec {
        container,
        command,
        pid_file,
        pair,
    } = pending;

    let mut cmd = CommandBuilder::new(binary);
    cmd.args(["exec", "-i", "-t", "-e", "TERM=xterm-256color"]);
    cmd.arg(&container);
    for part in wrapped_command(&pid_file, &command) {
        cmd.arg(part);
    }
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ContainerError::Pty(format!("failed to spawn {binary} exec: {e}")))?;
    // Only the child may hold the slave, otherwise the master never sees EOF.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ContainerError::Pty(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ContainerError::Pty(format!("failed to take PTY writer: {e}")))?;

    let closer = Arc::new(PtyCloser {
        binary: binary.to_string(),
        container: container.clone(),
        pid_file,
        killer: Mutex::new(Some(child.clone_killer())),
        master: Mutex::new(Some(pair.master)),
    });

    tokio::task::spawn_blocking(move || match child.wait() {
        Ok(status) => debug!("exec client for {} exited: {:?}", container, status),
        Err(e) => warn!("failed waiting on exec client for {}: {:?}", container, e),
    });

    Ok(ExecChannel::new(Box::new(PtyReader(reader)), writer, closer))
}

/// Maps the EIO a PTY master reports after the slave closes to a clean EOF.
struct PtyReader(Box<dyn Read + Send>);

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }
}

struct PtyCloser {
    binary: String,
    container: String,
    pid_file: String,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
}

impl PtyCloser {
    /// Hang up the in-container process without waiting on the runtime.
    fn hangup_remote(&self) -> io::Result<()> {
        let mut child = Command::new(&self.binary)
            .arg("exec")
            .arg(&self.container)
            .args(hangup_command(&self.pid_file))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let container = self.container.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!("hangup in {} exited: {:?}", container, status),
            Err(e) => warn!("failed waiting on hangup in {}: {:?}", container, e),
        });
        Ok(())
    }
}

impl ChannelCloser for PtyCloser {
    fn shutdown(&self) -> io::Result<()> {
        let killer = self
            .killer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut killer) = killer else {
            return Ok(());
        };

        if let Err(e) = self.hangup_remote() {
            warn!("failed to hang up shell in {}: {}", self.container, e);
        }
        if let Err(e) = killer.kill() {
            // The client may already have exited on its own.
            debug!("exec client kill: {}", e);
        }

        self.master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Ok(())
    }
}
