//! Listener shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time to wait for background tasks before giving up on them.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals background tasks to stop and waits for them, bounded by a timeout.
///
/// `done` is cancelled once a graceful shutdown has finished waiting, so
/// concurrent callers can wait for the first one to complete.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    done: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator with nothing cancelled.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether a graceful shutdown has completed.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once a graceful shutdown has completed.
    pub async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    /// Cancel the token, then wait up to `timeout` for `handles`.
    ///
    /// Returns `false` when the timeout elapsed first; the stragglers are
    /// left running.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        debug!(
            listener_tasks = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining listener"
        );

        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if !drained {
            warn!(?timeout, "listener did not stop in time");
        }
        self.done.cancel();
        drained
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
