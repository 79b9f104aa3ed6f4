//! One-shot teardown of a streaming bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::container::ChannelCloser;

/// Runs the teardown sequence at most once, whoever triggers it first.
/// Dropping the guard triggers it too.
pub(crate) struct Teardown {
    done: AtomicBool,
    cancel: CancellationToken,
    closer: Arc<dyn ChannelCloser>,
}

impl Teardown {
    pub fn new(cancel: CancellationToken, closer: Arc<dyn ChannelCloser>) -> Self {
        Self {
            done: AtomicBool::new(false),
            cancel,
            closer,
        }
    }

    /// Cancel the workers and shut the channel down. Returns `false` when
    /// teardown had already run.
    pub fn run(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        if let Err(e) = self.closer.shutdown() {
            warn!("exec channel shutdown failed: {}", e);
        }
        true
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}
