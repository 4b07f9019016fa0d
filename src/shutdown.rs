//! Shutdown manager for graceful daemon termination.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coordinates graceful shutdown of all long-lived tasks.
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to all spawned tasks
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Wait for ctrl+c or an internal shutdown trigger (the admin
    /// endpoint cancels the token), then drain all registered tasks.
    pub async fn wait_for_shutdown(mut self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("failed to listen for shutdown signal: {}", e);
                    return;
                }
                tracing::info!("shutdown signal received");
            }
            _ = self.cancel_token.cancelled() => {
                tracing::info!("shutdown triggered");
            }
        }

        // Signal all tasks to stop
        self.cancel_token.cancel();

        // Wait for all tasks to complete with a timeout
        let timeout = tokio::time::Duration::from_secs(10);
        let shutdown_tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(timeout, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("all tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!("shutdown timeout: some tasks did not complete");
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
