//! Cross-thread stop request for a running event loop.

use mio::{Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Token reserved for the loop's waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Handle that asks an event loop to stop and wakes it from `poll`.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub(crate) fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            stopped: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Waker::new(registry, WAKER_TOKEN)?),
        })
    }

    /// Request the loop to stop. Safe to call from any thread, any number of times.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake event loop");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
