//! Long-lived settlement loop.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::config::QueueConfig;
use crate::settlement::processor::{ProcessError, QueueProcessor};

/// Runs drain passes until shutdown.
pub struct SettlementWorker {
    processor: Arc<QueueProcessor>,
    config: QueueConfig,
}

impl SettlementWorker {
    pub fn new(processor: Arc<QueueProcessor>, config: QueueConfig) -> Self {
        Self { processor, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_backoff_secs = self.config.max_backoff_secs,
            "Settlement worker starting"
        );

        let mut failures: u32 = 0;
        loop {
            let healthy = self.processor.chain().is_healthy().await;
            if healthy {
                match self.processor.drain_once().await {
                    Ok(report) => {
                        failures = 0;
                        if report.processed > 0 {
                            tracing::info!(
                                processed = report.processed,
                                confirmed = report.confirmed,
                                failed = report.failed,
                                "Drain pass complete"
                            );
                        }
                    }
                    Err(e @ (ProcessError::Unrecorded { .. } | ProcessError::Halted(_))) => {
                        tracing::error!(error = %e, "Settlement worker stopping");
                        break;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        tracing::error!(error = %e, failures, "Drain pass aborted");
                    }
                }
            } else {
                failures = failures.saturating_add(1);
                tracing::warn!(failures, "Chain unreachable, skipping drain pass");
            }

            let delay = if failures == 0 {
                Duration::from_secs(self.config.poll_interval_secs)
            } else {
                calculate_backoff(
                    failures,
                    self.config.poll_interval_secs * 1000,
                    self.config.max_backoff_secs * 1000,
                )
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Settlement worker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Exponential backoff capped at `max_ms`, plus up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(base_ms);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}
