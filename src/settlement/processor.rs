//! Queue drain: settles `queued` intents one at a time, oldest first.

use alloy::primitives::{TxHash, U256};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blockchain::{hash_hex, BlockchainError, TokenChain};
use crate::ledger::{LedgerError, LedgerStore, OnchainTx, Transition, TxKind, TxStatus};
use crate::observability::metrics;

/// Why one intent could not be settled.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Unsupported kind {0}")]
    UnsupportedKind(String),

    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),

    #[error(transparent)]
    Chain(#[from] BlockchainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Broadcast went out but the ledger never recorded it; the row is still
    /// `queued` and must not be drained again.
    #[error("Onchain tx {tx_id} broadcast as {tx_hash} but not recorded: {source}")]
    Unrecorded {
        tx_id: Uuid,
        tx_hash: String,
        #[source]
        source: LedgerError,
    },

    #[error("Queue processor halted: {0}")]
    Halted(String),
}

/// How long a settlement write keeps retrying while another connection
/// holds the SQLite writer lock. Each attempt already waits out the pool's
/// busy timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 12,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Counts from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub confirmed: usize,
    pub failed: usize,
}

/// A `failed` row whose transaction landed on-chain after all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandedFailure {
    pub tx_id: Uuid,
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

/// Drains the on-chain intent queue through a [`TokenChain`].
///
/// Never touches balances; it only records settlement status. There is no
/// automatic retry: a failed row stays failed until an operator requeues it.
///
/// A broadcast whose `sent` write cannot land halts the processor: every
/// later drain is refused until restart, so the still-`queued` row is never
/// broadcast twice.
pub struct QueueProcessor {
    store: LedgerStore,
    chain: Arc<dyn TokenChain>,
    receipt_timeout: Duration,
    write_retry: WriteRetry,
    drain_lock: Mutex<()>,
    halted: OnceLock<String>,
}

impl QueueProcessor {
    pub fn new(store: LedgerStore, chain: Arc<dyn TokenChain>) -> Self {
        let receipt_timeout = chain.receipt_timeout();
        Self {
            store,
            chain,
            receipt_timeout,
            write_retry: WriteRetry::default(),
            drain_lock: Mutex::new(()),
            halted: OnceLock::new(),
        }
    }

    pub fn with_write_retry(mut self, write_retry: WriteRetry) -> Self {
        self.write_retry = write_retry;
        self
    }

    /// Why the processor stopped draining, if it did.
    pub fn halted(&self) -> Option<&str> {
        self.halted.get().map(String::as_str)
    }

    pub fn with_receipt_timeout(mut self, receipt_timeout: Duration) -> Self {
        self.receipt_timeout = receipt_timeout;
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn chain(&self) -> &Arc<dyn TokenChain> {
        &self.chain
    }

    /// Process every queued intent, then return.
    ///
    /// A failing intent is recorded as `failed` and the drain moves on. The
    /// drain itself only errors when the ledger cannot be read, cannot
    /// record a failure (which would otherwise select the same row forever),
    /// or cannot record a broadcast, which also halts the processor.
    pub async fn drain_once(&self) -> Result<DrainReport, ProcessError> {
        let _guard = self.drain_lock.lock().await;
        if let Some(reason) = self.halted() {
            return Err(ProcessError::Halted(reason.to_string()));
        }
        let start = Instant::now();
        let mut report = DrainReport::default();

        let depth = {
            let mut conn = self.store.acquire().await?;
            let counts = self.store.count_by_status(&mut conn).await?;
            counts.get(TxStatus::Queued.as_str()).copied().unwrap_or(0)
        };

        loop {
            let next = {
                let mut conn = self.store.acquire().await?;
                self.store.oldest_queued(&mut conn).await?
            };
            let Some(tx) = next else {
                tracing::info!("Queue empty");
                break;
            };

            report.processed += 1;
            match self.settle(&tx).await {
                Ok(tx_hash) => {
                    report.confirmed += 1;
                    metrics::record_settlement(&tx.kind, TxStatus::Confirmed.as_str());
                    tracing::info!(tx_id = %tx.id, "Confirmed {} -> {}", tx.kind, tx_hash);
                }
                Err(ProcessError::Unrecorded {
                    tx_id,
                    tx_hash,
                    source,
                }) => {
                    let reason = format!(
                        "onchain tx {} broadcast as {} but still queued: {}",
                        tx_id, tx_hash, source
                    );
                    tracing::error!(
                        tx_id = %tx_id,
                        tx_hash = %tx_hash,
                        error = %source,
                        "Broadcast not recorded; halting queue processor. Reconcile the row before restarting"
                    );
                    let _ = self.halted.set(reason);
                    return Err(ProcessError::Unrecorded {
                        tx_id,
                        tx_hash,
                        source,
                    });
                }
                Err(e) => {
                    self.record_failure(&tx, &e).await?;
                    report.failed += 1;
                    metrics::record_settlement(&tx.kind, TxStatus::Failed.as_str());
                    tracing::error!(kind = %tx.kind, "Failed {}: {}", tx.id, e);
                }
            }
        }

        metrics::record_drain(start, depth);
        Ok(report)
    }

    /// Submit one intent and follow it to a receipt. Returns the tx hash.
    async fn settle(&self, tx: &OnchainTx) -> Result<String, ProcessError> {
        let (voucher, wallet) = {
            let mut conn = self.store.acquire().await?;
            let voucher = match tx.voucher_type_id {
                Some(id) => self.store.voucher_type(&mut conn, id).await?,
                None => None,
            }
            .ok_or_else(|| {
                ProcessError::ReferenceNotFound(format!(
                    "voucher type {}",
                    display_ref(tx.voucher_type_id)
                ))
            })?;
            let wallet = match tx.to_wallet_id {
                Some(id) => self.store.wallet(&mut conn, id).await?,
                None => None,
            }
            .ok_or_else(|| {
                ProcessError::ReferenceNotFound(format!(
                    "wallet {}",
                    display_ref(tx.to_wallet_id)
                ))
            })?;
            (voucher, wallet)
        };

        let kind = tx.parsed_kind().map_err(ProcessError::UnsupportedKind)?;
        let token_id = voucher.token_id.0;
        let amount = U256::from(tx.amount.unsigned_abs());

        let submission = match kind {
            TxKind::Mint1155 => {
                self.chain
                    .mint_to(wallet.address.0, token_id, amount, None)
                    .await?
            }
            TxKind::SafeTransfer1155 => {
                let from = self.chain.signer_address();
                self.chain
                    .safe_transfer(from, wallet.address.0, token_id, amount, None)
                    .await?
            }
        };

        let tx_hash = hash_hex(&submission.tx_hash);
        self.advance_with_retry(
            tx.id,
            Transition::Sent {
                tx_hash: tx_hash.clone(),
                nonce: submission.nonce,
            },
        )
        .await
        .map_err(|source| ProcessError::Unrecorded {
            tx_id: tx.id,
            tx_hash: tx_hash.clone(),
            source,
        })?;
        tracing::debug!(tx_id = %tx.id, tx_hash = %tx_hash, nonce = submission.nonce, "Recorded sent");

        let receipt = self
            .chain
            .wait_for_receipt(submission.tx_hash, self.receipt_timeout)
            .await?;

        self.advance_with_retry(
            tx.id,
            Transition::Confirmed {
                gas_price: Some(submission.fee.recorded_price_native()),
            },
        )
        .await?;
        tracing::debug!(
            tx_id = %tx.id,
            block_number = ?receipt.block_number,
            gas_used = receipt.gas_used,
            "Recorded confirmed"
        );

        Ok(tx_hash)
    }

    /// Apply `transition`, retrying while the writer lock is held elsewhere.
    /// A retry that finds the row already at the target counts as landed.
    async fn advance_with_retry(&self, id: Uuid, transition: Transition) -> Result<(), LedgerError> {
        let target = transition.target();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.store.acquire().await {
                Ok(mut conn) => self.store.advance(&mut conn, id, transition.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => return Ok(()),
                Err(LedgerError::InvalidTransition { from, .. }) if attempt > 1 && from == target => {
                    return Ok(())
                }
                Err(e) if e.is_busy() && attempt < self.write_retry.attempts => {
                    tracing::warn!(
                        tx_id = %id,
                        status = %target,
                        attempt,
                        error = %e,
                        "Ledger busy, retrying settlement write"
                    );
                    tokio::time::sleep(self.write_retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_failure(&self, tx: &OnchainTx, error: &ProcessError) -> Result<(), ProcessError> {
        match self
            .advance_with_retry(
                tx.id,
                Transition::Failed {
                    error: error.to_string(),
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            // Already terminal; nothing left to record and the row will not be selected again.
            Err(e @ LedgerError::InvalidTransition { .. }) => {
                tracing::warn!(tx_id = %tx.id, error = %e, "Could not record failure");
                Ok(())
            }
            Err(e) => {
                tracing::error!(tx_id = %tx.id, error = %e, "Recording failure failed, aborting drain");
                Err(e.into())
            }
        }
    }

    /// Check `failed` rows that were broadcast for a receipt that landed
    /// after the wait gave up. Read-only: findings are reported, not applied.
    pub async fn audit_failed(&self) -> Result<Vec<LandedFailure>, ProcessError> {
        let rows = {
            let mut conn = self.store.acquire().await?;
            self.store.failed_with_hash(&mut conn).await?
        };

        let mut landed = Vec::new();
        for row in rows {
            let Some(raw_hash) = row.tx_hash.as_deref() else {
                continue;
            };
            let Ok(tx_hash) = raw_hash.parse::<TxHash>() else {
                tracing::warn!(tx_id = %row.id, tx_hash = raw_hash, "Unparseable tx hash");
                continue;
            };

            match self.chain.receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    tracing::warn!(
                        tx_id = %row.id,
                        tx_hash = raw_hash,
                        block_number = ?receipt.block_number,
                        "Failed intent landed on-chain; reconcile manually"
                    );
                    landed.push(LandedFailure {
                        tx_id: row.id,
                        tx_hash: raw_hash.to_string(),
                        block_number: receipt.block_number,
                    });
                }
                Ok(None) | Err(BlockchainError::Reverted { .. }) => {}
                Err(e) => {
                    tracing::warn!(tx_id = %row.id, error = %e, "Receipt lookup failed");
                }
            }
        }

        Ok(landed)
    }
}

fn display_ref(id: Option<Uuid>) -> String {
    id.map_or_else(|| "(none)".to_string(), |id| id.to_string())
}
