//! Cooperative shutdown: stop intake, drain in-flight work, bounded wait.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Owns the cancellation token and the tracker all engine tasks run under.
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Cancels every loop, then waits up to `timeout` for in-flight handlers.
    ///
    /// Returns `true` when everything finished inside the deadline; on `false`
    /// the stragglers are left to the runtime to cancel at process exit.
    pub async fn drain(&self, timeout: Duration) -> bool {
        info!(timeout = ?timeout, "draining in-flight work");
        self.token.cancel();
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("drain complete");
                true
            }
            Err(_) => {
                warn!(timeout = ?timeout, "drain deadline exceeded, abandoning stragglers");
                false
            }
        }
    }
}
