//! Single-shot wakeup used by the merge primitives to rouse a sleeping consumer.
//!
//! A [`Signal`] starts armed and resolves at most once. Consumers never reuse a
//! resolved signal: after acting on a resolution they swap in a fresh one (see
//! [`Signal::rearm`]), which is what gives each drain cycle its own wakeup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

struct Inner {
    resolved: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to one wakeup cycle.
///
/// Every clone observes the same resolution.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl Signal {
    /// Create an armed signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                resolved: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the signal, waking every current waiter.
    ///
    /// Later calls within the same cycle have no effect.
    pub fn resolve(&self) {
        if !self.inner.resolved.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether [`resolve`](Self::resolve) has been called.
    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::SeqCst)
    }

    /// Wait until the signal resolves. Returns immediately if it already has.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent resolve is not missed.
        let _ = notified.as_mut().enable();
        if self.is_resolved() {
            return;
        }
        notified.await;
    }

    /// Replace `slot` with a fresh armed signal and return the consumed one.
    pub fn rearm(slot: &mut Self) -> Self {
        std::mem::take(slot)
    }

    /// Whether two handles refer to the same cycle.
    pub fn same_cycle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
