//! Cooperative interrupt signal shared between the loop and the outside world.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Clonable handle the UI layer uses to abort a running conversation
/// (ctrl-c).  Once triggered it stays triggered for the life of the loop.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the handle is triggered.  Registers for notification
    /// before re-checking the flag so a trigger between the check and the
    /// await cannot be missed.
    pub async fn triggered(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
