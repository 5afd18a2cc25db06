//! Signal-of-Stop: cooperative cancellation shared by a node, its links and
//! their I/O tasks.
//!
//! Clones share one flag. Cancelling any clone wakes every waiter, including
//! waiters that registered after the cancel.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation token.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    inner: Arc<Shared>,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every clone. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Resolve once cancelled.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a cancel in between is not lost.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Run `fut` until it finishes or the signal fires. `None` means cancelled.
    pub async fn run_until<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            out = fut => Some(out),
        }
    }
}
