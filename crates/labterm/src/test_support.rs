//! Shared fakes for unit tests.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use async_trait::async_trait;

use crate::container::{
    ChannelCloser, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    ContainerStats, ExecChannel,
};

enum Feed {
    Data(Vec<u8>),
    Eof,
    Error(String),
}

/// Test-side handle of an in-memory exec channel.
#[derive(Clone)]
pub(crate) struct MemoryExec {
    feed: mpsc::Sender<Feed>,
    written: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryExec {
    pub fn channel() -> (MemoryExec, ExecChannel) {
        let (tx, rx) = mpsc::channel();
        let handle = MemoryExec {
            feed: tx.clone(),
            written: Arc::new(Mutex::new(Vec::new())),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        };
        let reader = MemoryReader {
            rx,
            pending: Vec::new(),
            done: false,
        };
        let writer = MemoryWriter {
            written: handle.written.clone(),
            fail: handle.fail_writes.clone(),
        };
        let closer = MemoryCloser {
            feed: Mutex::new(tx),
            shutdowns: handle.shutdowns.clone(),
        };
        let channel = ExecChannel::new(Box::new(reader), Box::new(writer), Arc::new(closer));
        (handle, channel)
    }

    pub fn send(&self, data: &[u8]) {
        let _ = self.feed.send(Feed::Data(data.to_vec()));
    }

    pub fn eof(&self) {
        let _ = self.feed.send(Feed::Eof);
    }

    pub fn fail_read(&self, message: &str) {
        let _ = self.feed.send(Feed::Error(message.to_string()));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Poll until `written()` has at least `len` bytes.
    pub async fn wait_written(&self, len: usize) -> Vec<u8> {
        for _ in 0..200 {
            let data = self.written();
            if data.len() >= len {
                return data;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.written()
    }
}

struct MemoryReader {
    rx: mpsc::Receiver<Feed>,
    pending: Vec<u8>,
    done: bool,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Feed::Data(data)) => self.pending = data,
                Ok(Feed::Eof) | Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
                Ok(Feed::Error(message)) => {
                    self.done = true;
                    return Err(io::Error::other(message));
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct MemoryWriter {
    written: Arc<Mutex<Vec<u8>>>,
    fail: Arc<AtomicBool>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemoryCloser {
    feed: Mutex<mpsc::Sender<Feed>>,
    shutdowns: Arc<AtomicUsize>,
}

impl ChannelCloser for MemoryCloser {
    fn shutdown(&self) -> io::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        let _ = self.feed.lock().unwrap().send(Feed::Eof);
        Ok(())
    }
}

/// In-memory container runtime.
///
/// Created containers are `running`; removed ones disappear.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    statuses: Mutex<HashMap<String, String>>,
    images: Mutex<HashSet<String>>,
    builds: Mutex<Vec<String>>,
    created: Mutex<Vec<ContainerConfig>>,
    stopped: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    run_failures: Mutex<HashMap<String, String>>,
    build_error: Mutex<Option<String>>,
    inspect_error: Mutex<Option<String>>,
    exec_create_error: Mutex<Option<String>>,
    exec_start_error: Mutex<Option<String>>,
    capture_error: Mutex<Option<String>>,
    capture_output: Mutex<Vec<u8>>,
    create_delay: Mutex<Option<Duration>>,
    build_delay: Mutex<Option<Duration>>,
    exec_commands: Mutex<Vec<Vec<String>>>,
    execs: Mutex<Vec<MemoryExec>>,
    stats: Mutex<Option<ContainerStats>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, name: &str, status: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.to_string());
    }

    pub fn status(&self, name: &str) -> Option<String> {
        self.statuses.lock().unwrap().get(name).cloned()
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn fail_run(&self, image: &str, message: &str) {
        self.run_failures
            .lock()
            .unwrap()
            .insert(image.to_string(), message.to_string());
    }

    pub fn fail_build(&self, message: &str) {
        *self.build_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_inspect(&self, message: &str) {
        *self.inspect_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_exec_create(&self, message: &str) {
        *self.exec_create_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_exec_start(&self, message: &str) {
        *self.exec_start_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_capture(&self, message: &str) {
        *self.capture_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_capture_output(&self, output: &[u8]) {
        *self.capture_output.lock().unwrap() = output.to_vec();
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_stats(&self, stats: ContainerStats) {
        *self.stats.lock().unwrap() = Some(stats);
    }

    pub fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<ContainerConfig> {
        self.created.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn exec_creates(&self) -> usize {
        self.exec_commands.lock().unwrap().len()
    }

    pub fn last_exec_command(&self) -> Option<Vec<String>> {
        self.exec_commands.lock().unwrap().last().cloned()
    }

    pub fn last_exec(&self) -> Option<MemoryExec> {
        self.execs.lock().unwrap().last().cloned()
    }

    pub fn exec_count(&self) -> usize {
        self.execs.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn build_image(
        &self,
        _context: &Path,
        _dockerfile: &Path,
        tag: &str,
    ) -> ContainerResult<()> {
        if let Some(message) = self.build_error.lock().unwrap().clone() {
            return Err(ContainerError::CommandFailed {
                command: "build".to_string(),
                message,
            });
        }
        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.builds.lock().unwrap().push(tag.to_string());
        self.images.lock().unwrap().insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.created.lock().unwrap().push(config.clone());
        let name = config.name.clone().unwrap_or_else(|| "anon".to_string());
        if let Some(message) = self.run_failures.lock().unwrap().get(&config.image).cloned() {
            // Mirror a container that was created but failed to start.
            self.set_status(&name, "created");
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message,
            });
        }
        self.set_status(&name, "running");
        Ok(format!("id-{name}"))
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stopped.lock().unwrap().push(container_id.to_string());
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.get_mut(container_id) {
            Some(status) => {
                *status = "exited".to_string();
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        match self.statuses.lock().unwrap().remove(container_id) {
            Some(_) => {
                self.removed.lock().unwrap().push(container_id.to_string());
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        if let Some(message) = self.inspect_error.lock().unwrap().clone() {
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message,
            });
        }
        Ok(self.status(id_or_name))
    }

    async fn exec_create(&self, container_id: &str, command: &[String]) -> ContainerResult<String> {
        self.exec_commands.lock().unwrap().push(command.to_vec());
        if let Some(message) = self.exec_create_error.lock().unwrap().clone() {
            return Err(ContainerError::Pty(message));
        }
        Ok(format!("exec-{container_id}"))
    }

    async fn exec_start(&self, _exec_id: &str) -> ContainerResult<ExecChannel> {
        if let Some(message) = self.exec_start_error.lock().unwrap().clone() {
            return Err(ContainerError::Pty(message));
        }
        let (handle, channel) = MemoryExec::channel();
        self.execs.lock().unwrap().push(handle);
        Ok(channel)
    }

    async fn exec_capture(
        &self,
        _container_id: &str,
        _command: &[String],
    ) -> ContainerResult<Vec<u8>> {
        if let Some(message) = self.capture_error.lock().unwrap().clone() {
            return Err(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message,
            });
        }
        Ok(self.capture_output.lock().unwrap().clone())
    }

    async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        self.stats
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
    }
}
