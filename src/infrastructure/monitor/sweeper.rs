use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::TaskMonitor;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically asks the monitor to time out stale tasks.
pub struct TimeoutSweeper {
    handle: JoinHandle<()>,
}

impl TimeoutSweeper {
    pub fn spawn(monitor: Arc<dyn TaskMonitor>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately, skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = monitor.check_timeouts().await {
                    tracing::error!(error = %err, "timeout sweep failed");
                }
            }
        });
        Self { handle }
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
