//! Blocking worker threads that pump an exec channel.

use std::io::{ErrorKind, Read, Write};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Largest single read from the exec channel.
pub(crate) const READ_CHUNK: usize = 4096;

/// Sent from the workers to the connection task.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Output(String),
    Eof,
    ReadFailed(String),
    WriteFailed(String),
}

/// Lossy UTF-8 decoder that keeps an incomplete trailing sequence for the
/// next chunk and drops invalid bytes.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => rest = &after[len..],
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Read the channel until EOF, error or cancellation.
pub(crate) fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        let mut decoder = Utf8Decoder::default();
        while !cancel.is_cancelled() {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = events.blocking_send(WorkerEvent::Eof);
                    break;
                }
                Ok(n) => {
                    trace!("read {} bytes from exec", n);
                    let text = decoder.decode(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if events.blocking_send(WorkerEvent::Output(text)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = events.blocking_send(WorkerEvent::ReadFailed(e.to_string()));
                    break;
                }
            }
        }
        debug!("exec reader finished");
    })
}

/// Write queued client input in order until the queue is dropped.
pub(crate) fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<WorkerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush())
                && events
                    .blocking_send(WorkerEvent::WriteFailed(e.to_string()))
                    .is_err()
            {
                break;
            }
        }
        debug!("exec writer finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryExec;

    #[test]
    fn decoder_carries_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let check = "✅ ok".as_bytes();
        assert_eq!(decoder.decode(&check[..2]), "");
        assert_eq!(decoder.decode(&check[2..]), "✅ ok");
    }

    #[test]
    fn decoder_drops_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb\xc3\x28c"), "ab(c");
        // A literal replacement character in the stream is kept.
        assert_eq!(decoder.decode("x\u{FFFD}y".as_bytes()), "x\u{FFFD}y");
    }

    #[tokio::test]
    async fn reader_forwards_then_reports_eof() {
        let (handle, channel) = MemoryExec::channel();
        let (reader, _writer, _closer) = channel.into_parts();
        let (tx, mut rx) = mpsc::channel(8);
        let task = spawn_reader(reader, tx, CancellationToken::new());

        handle.send(b"root@lab:~# ");
        handle.eof();

        assert_eq!(rx.recv().await, Some(WorkerEvent::Output("root@lab:~# ".into())));
        assert_eq!(rx.recv().await, Some(WorkerEvent::Eof));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reader_reports_errors() {
        let (handle, channel) = MemoryExec::channel();
        let (reader, _writer, _closer) = channel.into_parts();
        let (tx, mut rx) = mpsc::channel(8);
        let task = spawn_reader(reader, tx, CancellationToken::new());

        handle.fail_read("Input/output error");
        assert_eq!(
            rx.recv().await,
            Some(WorkerEvent::ReadFailed("Input/output error".into()))
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_keeps_order_and_survives_failures() {
        let (handle, channel) = MemoryExec::channel();
        let (_reader, writer, _closer) = channel.into_parts();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let task = spawn_writer(writer, input_rx, events_tx);

        for part in ["ls", " -la", "\r"] {
            input_tx.send(part.as_bytes().to_vec()).unwrap();
        }
        assert_eq!(handle.wait_written(7).await, b"ls -la\r");

        handle.fail_writes(true);
        input_tx.send(b"x".to_vec()).unwrap();
        assert!(matches!(events_rx.recv().await, Some(WorkerEvent::WriteFailed(_))));

        handle.fail_writes(false);
        input_tx.send(b"pwd\r".to_vec()).unwrap();
        assert_eq!(handle.wait_written(11).await, b"ls -la\rpwd\r");

        drop(input_tx);
        task.await.unwrap();
    }
}
