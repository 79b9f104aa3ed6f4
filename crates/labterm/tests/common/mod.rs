//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, header};

use labterm::api::{self, AppState};
use labterm::container::{
    ChannelCloser, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    ContainerStats, ExecChannel,
};
use labterm::session::{SessionService, SessionServiceConfig};

pub const LAB: &str = "lab-01-3am-crash";

/// Container runtime double whose interactive execs echo their input.
#[derive(Default)]
pub struct TestRuntime {
    statuses: Mutex<HashMap<String, String>>,
    failing_images: Mutex<Vec<String>>,
    validator_output: Mutex<Vec<u8>>,
    shutdowns: Arc<AtomicUsize>,
}

impl TestRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self, name: &str) -> Option<String> {
        self.statuses.lock().unwrap().get(name).cloned()
    }

    pub fn fail_image(&self, image: &str) {
        self.failing_images.lock().unwrap().push(image.to_string());
    }

    pub fn set_validator_output(&self, output: &str) {
        *self.validator_output.lock().unwrap() = output.as_bytes().to_vec();
    }

    pub fn exec_shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntimeApi for TestRuntime {
    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(false)
    }

    async fn build_image(&self, _: &Path, _: &Path, _tag: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        if self.failing_images.lock().unwrap().contains(&config.image) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: format!("unable to find image '{}'", config.image),
            });
        }
        let name = config.name.clone().unwrap_or_default();
        self.statuses
            .lock()
            .unwrap()
            .insert(name.clone(), "running".to_string());
        Ok(name)
    }

    async fn stop_container(&self, id: &str, _timeout: Option<u32>) -> ContainerResult<()> {
        match self.statuses.lock().unwrap().get_mut(id) {
            Some(status) => {
                *status = "exited".to_string();
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str, _force: bool) -> ContainerResult<()> {
        self.statuses
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ContainerError::ContainerNotFound(id.to_string()))
    }

    async fn container_state_status(&self, id: &str) -> ContainerResult<Option<String>> {
        Ok(self.status(id))
    }

    async fn exec_create(&self, container_id: &str, _command: &[String]) -> ContainerResult<String> {
        Ok(format!("exec-{container_id}"))
    }

    async fn exec_start(&self, _exec_id: &str) -> ContainerResult<ExecChannel> {
        Ok(echo_channel(self.shutdowns.clone()))
    }

    async fn exec_capture(&self, _id: &str, _command: &[String]) -> ContainerResult<Vec<u8>> {
        Ok(self.validator_output.lock().unwrap().clone())
    }

    async fn get_stats(&self, id: &str) -> ContainerResult<ContainerStats> {
        let json = format!(r#"{{"Name":"{id}","MemUsage":"256MiB / 1GiB"}}"#);
        serde_json::from_str(&json).map_err(|e| ContainerError::ParseError(e.to_string()))
    }
}

enum Chunk {
    Data(Vec<u8>),
    Eof,
}

struct EchoReader {
    rx: mpsc::Receiver<Chunk>,
}

impl Read for EchoReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv() {
            Ok(Chunk::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(Chunk::Eof) | Err(_) => Ok(0),
        }
    }
}

struct EchoWriter {
    tx: mpsc::Sender<Chunk>,
}

impl Write for EchoWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Chunk::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct EchoCloser {
    tx: Mutex<mpsc::Sender<Chunk>>,
    shutdowns: Arc<AtomicUsize>,
}

impl ChannelCloser for EchoCloser {
    fn shutdown(&self) -> io::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.lock().unwrap().send(Chunk::Eof);
        Ok(())
    }
}

fn echo_channel(shutdowns: Arc<AtomicUsize>) -> ExecChannel {
    let (tx, rx) = mpsc::channel();
    ExecChannel::new(
        Box::new(EchoReader { rx }),
        Box::new(EchoWriter { tx: tx.clone() }),
        Arc::new(EchoCloser {
            tx: Mutex::new(tx),
            shutdowns,
        }),
    )
}

pub fn service(runtime: Arc<TestRuntime>) -> SessionService {
    SessionService::new(
        runtime,
        SessionServiceConfig {
            labs_dir: "/nonexistent/labterm-labs".into(),
            provision_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
}

pub fn app(runtime: Arc<TestRuntime>) -> Router {
    api::create_router(AppState::new(service(runtime), LAB))
}

/// Serve the router on an ephemeral local port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
