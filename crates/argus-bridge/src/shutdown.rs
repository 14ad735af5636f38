//! Shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default grace period before remaining tasks are aborted.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Coordinates shutdown across the bridge's background tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// New coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown was signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, wait up to `grace` for `handles`, then abort the rest.
    ///
    /// Returns `true` if every task finished within the grace period.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, grace: Option<Duration>) -> bool {
        let grace = grace.unwrap_or(DEFAULT_GRACE);
        self.shutdown();
        info!(task_count = handles.len(), grace_ms = grace.as_millis(), "waiting for tasks to complete");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("shutdown grace of {grace:?} elapsed, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
            return false;
        }
        true
    }
}
