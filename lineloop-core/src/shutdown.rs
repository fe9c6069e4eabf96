use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative cancellation handle threaded through the controller, the
/// iteration engine and the assistant runner.
///
/// Signal handlers only call [`Shutdown::request`]; the controller checks
/// the flag between iterations so the current iteration completes cleanly,
/// and the runner selects on [`Shutdown::cancelled`] so a mid-phase signal
/// takes the graceful-stop path.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves when shutdown is requested; resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        if self.is_requested() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}
