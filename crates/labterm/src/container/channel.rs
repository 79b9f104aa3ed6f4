//! Raw duplex byte channel to a process running inside a container.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Shuts a channel down so that a reader blocked on it returns.
///
/// Implementations must be idempotent: a second call is a no-op returning `Ok`.
pub trait ChannelCloser: Send + Sync {
    fn shutdown(&self) -> io::Result<()>;
}

/// An exec channel: blocking reader, blocking writer and a shutdown handle.
///
/// There is no framing and no non-blocking mode. The halves are meant to be
/// moved onto separate worker threads.
pub struct ExecChannel {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    closer: Arc<dyn ChannelCloser>,
}

impl ExecChannel {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        closer: Arc<dyn ChannelCloser>,
    ) -> Self {
        Self {
            reader,
            writer,
            closer,
        }
    }

    /// Split into reader, writer and closer.
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn Read + Send>,
        Box<dyn Write + Send>,
        Arc<dyn ChannelCloser>,
    ) {
        (self.reader, self.writer, self.closer)
    }
}

impl fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecChannel").finish_non_exhaustive()
    }
}
