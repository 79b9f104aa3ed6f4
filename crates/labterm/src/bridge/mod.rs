//! Terminal bridge between a WebSocket client and an interactive exec.
//!
//! One bridge serves one connection. The connection task owns every send to
//! the client; two blocking workers own the exec channel halves. Output flows
//! reader worker -> bounded queue -> client, input flows client -> unbounded
//! queue -> writer worker, so client writes reach the shell in receipt order.
//!
//! The input queue is unbounded: a client that types faster than the shell
//! consumes input grows it without limit.

mod notice;
mod teardown;
mod worker;

pub use notice::{GREETING, Notice};

use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::exec::{AttachError, ExecAttacher};
use teardown::Teardown;
use worker::WorkerEvent;

/// Output events buffered between the reader worker and the connection task.
const EVENT_BUFFER: usize = 64;

/// Upper bound on the closing handshake with a client that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Failures while streaming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Attaching,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Never reached streaming.
    AttachFailed(AttachError),
    /// The shell exited.
    SandboxEof,
    ReadFailed(String),
    ClientDisconnected,
    /// Destroy or server shutdown.
    Cancelled,
}

/// Outcome of one bridge run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    /// Furthest state reached before closing.
    pub state_reached: BridgeState,
    pub close_reason: CloseReason,
    /// Client bytes queued for the shell.
    pub bytes_in: u64,
    /// Shell output bytes sent to the client.
    pub bytes_out: u64,
}

impl BridgeReport {
    /// Whether the sandbox was found missing while attaching.
    pub fn sandbox_gone(&self) -> bool {
        matches!(&self.close_reason, CloseReason::AttachFailed(e) if e.is_sandbox_gone())
    }
}

/// Send a single notice and close the connection without attaching.
pub async fn reject<Si>(mut sink: Si, notice: Notice)
where
    Si: Sink<Message> + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(Message::Text(notice.text().into())).await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;
}

enum Delivery {
    Sent,
    Disconnected,
    Cancelled,
}

/// Send one frame unless the bridge is cancelled first.
async fn deliver<Si>(sink: &mut Si, cancel: &CancellationToken, message: Message) -> Delivery
where
    Si: Sink<Message> + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        result = sink.send(message) => match result {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Disconnected,
        },
    }
}

pub struct TerminalBridge {
    session_id: String,
    container: String,
    command: Vec<String>,
    attacher: ExecAttacher,
    cancel: CancellationToken,
}

impl TerminalBridge {
    pub fn new(
        session_id: impl Into<String>,
        container: impl Into<String>,
        command: Vec<String>,
        attacher: ExecAttacher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            container: container.into(),
            command,
            attacher,
            cancel,
        }
    }

    /// Attach the shell and pump until either side ends or the bridge is
    /// cancelled.
    pub async fn run<Si, St, E>(self, mut sink: Si, mut stream: St) -> BridgeReport
    where
        Si: Sink<Message> + Unpin,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: std::fmt::Display,
    {
        let session_id = self.session_id.as_str();

        let attached = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.attacher.open_interactive(&self.container, &self.command) => Some(result),
        };
        let channel = match attached {
            None => {
                reject_silently(&mut sink).await;
                return BridgeReport {
                    state_reached: BridgeState::Attaching,
                    close_reason: CloseReason::Cancelled,
                    bytes_in: 0,
                    bytes_out: 0,
                };
            }
            Some(Err(e)) => {
                warn!(session_id, container = %self.container, "attach failed: {}", e);
                reject(&mut sink, Notice::from(&e)).await;
                return BridgeReport {
                    state_reached: BridgeState::Attaching,
                    close_reason: CloseReason::AttachFailed(e),
                    bytes_in: 0,
                    bytes_out: 0,
                };
            }
            Some(Ok(channel)) => channel,
        };

        let (reader, writer, closer) = channel.into_parts();
        let teardown = Teardown::new(self.cancel.clone(), closer);
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        worker::spawn_reader(reader, event_tx.clone(), self.cancel.clone());
        worker::spawn_writer(writer, input_rx, event_tx);

        info!(session_id, container = %self.container, "terminal attached");

        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;

        let greeting = Message::Text(Notice::Greeting.text().into());
        let close_reason = match deliver(&mut sink, &self.cancel, greeting).await {
            Delivery::Disconnected => CloseReason::ClientDisconnected,
            Delivery::Cancelled => CloseReason::Cancelled,
            Delivery::Sent => loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break CloseReason::Cancelled,
                    event = event_rx.recv() => match event {
                        Some(WorkerEvent::Output(text)) => {
                            let len = text.len() as u64;
                            let frame = Message::Text(text.into());
                            match deliver(&mut sink, &self.cancel, frame).await {
                                Delivery::Sent => bytes_out += len,
                                Delivery::Disconnected => break CloseReason::ClientDisconnected,
                                Delivery::Cancelled => break CloseReason::Cancelled,
                            }
                        }
                        Some(WorkerEvent::Eof) | None => break CloseReason::SandboxEof,
                        Some(WorkerEvent::ReadFailed(err)) => {
                            let notice = Notice::from(&StreamError::ReadFailed(err.clone()));
                            let frame = Message::Text(notice.text().into());
                            let _ = deliver(&mut sink, &self.cancel, frame).await;
                            break CloseReason::ReadFailed(err);
                        }
                        Some(WorkerEvent::WriteFailed(err)) => {
                            debug!(session_id, "write to exec failed: {}", err);
                            let notice = Notice::from(&StreamError::WriteFailed(err));
                            let frame = Message::Text(notice.text().into());
                            match deliver(&mut sink, &self.cancel, frame).await {
                                Delivery::Sent => {}
                                Delivery::Disconnected => break CloseReason::ClientDisconnected,
                                Delivery::Cancelled => break CloseReason::Cancelled,
                            }
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if !text.as_str().is_empty() {
                                bytes_in += text.as_str().len() as u64;
                                let _ = input_tx.send(text.as_str().as_bytes().to_vec());
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if !data.is_empty() {
                                bytes_in += data.len() as u64;
                                let _ = input_tx.send(data.to_vec());
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break CloseReason::ClientDisconnected,
                        Some(Err(e)) => {
                            debug!(session_id, "client stream error: {}", e);
                            break CloseReason::ClientDisconnected;
                        }
                    },
                }
            },
        };

        // Closing
        teardown.run();
        drop(input_tx);
        drop(event_rx);
        reject_silently(&mut sink).await;

        info!(
            session_id,
            ?close_reason,
            bytes_in,
            bytes_out,
            "terminal closed"
        );

        BridgeReport {
            state_reached: BridgeState::Closed,
            close_reason,
            bytes_in,
            bytes_out,
        }
    }
}

/// Best-effort Close frame, bounded by `CLOSE_TIMEOUT`.
async fn reject_silently<Si>(sink: &mut Si)
where
    Si: Sink<Message> + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;
}
