//! Shutdown coordination for the settlement service.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that the worker loop and the admin server
/// subscribe to.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait for `tasks` to finish, up to `deadline`. Returns `false` when
    /// the deadline passed with tasks still running.
    pub async fn join(&self, tasks: Vec<JoinHandle<()>>, deadline: Duration) -> bool {
        let all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "Task panicked during shutdown");
                }
            }
        };
        match tokio::time::timeout(deadline, all).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    deadline_secs = deadline.as_secs(),
                    remaining = self.receiver_count(),
                    "Shutdown deadline passed with tasks still running"
                );
                false
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });

        shutdown.trigger();
        assert!(shutdown.join(vec![task], Duration::from_secs(1)).await);
        assert_eq!(shutdown.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_join_times_out() {
        let shutdown = Shutdown::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        assert!(!shutdown.join(vec![task], Duration::from_millis(20)).await);
    }
}
