use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Fire-and-forget tasks spawned by extensions.
///
/// Tasks are tracked so shutdown (and tests) can wait for them, but nothing
/// awaits an individual task; failures are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        log::debug!("Spawning background task '{}'", name);
        self.tracker.spawn(async move {
            match future.await {
                Ok(()) => log::debug!("Background task '{}' finished", name),
                Err(e) => log::warn!("Background task '{}' failed: {:#}", name, e),
            }
        })
    }

    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every task spawned so far has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancelled once the kernel shuts down; long-running loops select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_spawned_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks.spawn("sleeper", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert!(tasks.active() > 0);

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test]
    async fn failing_task_is_only_logged() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("fails", async { Err(anyhow::anyhow!("expected")) });
        tasks.drain().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        tasks.spawn("after_drain", async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tasks.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
