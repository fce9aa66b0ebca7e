//! Transaction building, signing, broadcast and receipt polling.
//!
//! # Responsibilities
//! - Choose fee fields (EIP-1559 when the network reports a base fee)
//! - Estimate gas, falling back to a fixed limit
//! - Allocate the nonce, sign and broadcast
//! - Poll for the receipt until it appears or the wait times out

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::rpc::types::TransactionRequest;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::blockchain::client::BlockchainClient;
use crate::blockchain::nonce::NonceAllocator;
use crate::blockchain::types::{
    BlockchainError, BlockchainResult, FeeQuote, SettledReceipt, Submission,
};
use crate::blockchain::wallet::Wallet;

const GWEI: u128 = 1_000_000_000;

/// Submits contract calls from the platform signer.
#[derive(Debug)]
pub struct TxSender {
    client: BlockchainClient,
    wallet: Wallet,
    nonces: NonceAllocator,
}

impl TxSender {
    /// Create a new sender.
    pub fn new(client: BlockchainClient, wallet: Wallet) -> Self {
        Self {
            client,
            wallet,
            nonces: NonceAllocator::new(),
        }
    }

    pub fn client(&self) -> &BlockchainClient {
        &self.client
    }

    /// Get the wallet address.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Pick fee fields for the next submission.
    pub async fn quote_fees(&self) -> BlockchainResult<FeeQuote> {
        let config = self.client.config();
        let base_fee = match self.client.get_base_fee().await {
            Ok(base_fee) => base_fee,
            Err(e) => {
                tracing::debug!(error = %e, "Base fee unavailable, using legacy pricing");
                None
            }
        };

        let quote = match base_fee {
            Some(base_fee) if base_fee > 0 => {
                eip1559_quote(base_fee as u128, config.priority_fee_gwei as u128 * GWEI)
            }
            _ => FeeQuote::Legacy {
                gas_price: self.client.get_gas_price().await?,
            },
        };

        check_gas_cap(&quote, config.max_gas_price_gwei)?;
        Ok(quote)
    }

    /// Estimate gas for a request; never fails, falling back to the
    /// configured limit.
    pub async fn gas_limit(&self, request: &TransactionRequest) -> u64 {
        gas_or_fallback(
            self.client.estimate_gas(request).await,
            self.client.config().fallback_gas_limit,
        )
    }

    /// Build, sign and broadcast a call to `to` with `data`.
    pub async fn submit(&self, to: Address, data: Bytes) -> BlockchainResult<Submission> {
        let base = TransactionRequest::default()
            .with_from(self.wallet.address())
            .with_to(to)
            .with_input(data)
            .with_value(U256::ZERO);

        let fee = self.quote_fees().await?;
        let gas_limit = self.gas_limit(&base).await;
        let request = apply_fee(base.with_gas_limit(gas_limit), fee);

        let mut lease = self.nonces.lock().await;
        let pending = self.client.get_pending_nonce(self.wallet.address()).await?;
        let nonce = lease.reserve(pending);

        let raw = match self.wallet.sign_raw(request.with_nonce(nonce)).await {
            Ok(raw) => raw,
            Err(e) => {
                lease.invalidate();
                return Err(e);
            }
        };

        match self.client.send_raw_transaction(&raw).await {
            Ok(tx_hash) => {
                lease.commit();
                tracing::info!(
                    tx_hash = %tx_hash,
                    nonce,
                    gas_limit,
                    to = %to,
                    "Transaction broadcast"
                );
                Ok(Submission {
                    tx_hash,
                    nonce,
                    fee,
                })
            }
            Err(e) => {
                lease.invalidate();
                tracing::warn!(nonce, error = %e, "Broadcast failed");
                Err(e)
            }
        }
    }

    /// Look up a receipt once.
    pub async fn receipt(&self, tx_hash: TxHash) -> BlockchainResult<Option<SettledReceipt>> {
        let Some(receipt) = self.client.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        if !receipt.status() {
            return Err(BlockchainError::Reverted { tx_hash });
        }
        Ok(Some(SettledReceipt {
            tx_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }))
    }

    /// Poll until the receipt appears or `wait` elapses.
    ///
    /// RPC errors while polling are logged and polling continues; only the
    /// overall deadline ends the wait.
    pub async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        wait: Duration,
    ) -> BlockchainResult<SettledReceipt> {
        let poll_interval = Duration::from_millis(self.client.config().receipt_poll_interval_ms);

        let result = timeout(wait, async {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.receipt(tx_hash).await {
                    Ok(Some(settled)) => return Ok(settled),
                    Ok(None) => {
                        tracing::debug!(tx_hash = %tx_hash, "Transaction pending");
                    }
                    Err(e @ BlockchainError::Reverted { .. }) => return Err(e),
                    Err(e) => {
                        tracing::warn!(tx_hash = %tx_hash, error = %e, "Receipt poll failed");
                    }
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(BlockchainError::ReceiptTimeout {
                tx_hash,
                secs: wait.as_secs(),
            }),
        }
    }
}

/// Priority-fee quote: max fee is twice the base fee plus the tip.
pub fn eip1559_quote(base_fee: u128, priority_fee: u128) -> FeeQuote {
    FeeQuote::Eip1559 {
        max_fee_per_gas: base_fee.saturating_mul(2).saturating_add(priority_fee),
        max_priority_fee_per_gas: priority_fee,
    }
}

/// The estimate, or `fallback` when estimation failed.
pub fn gas_or_fallback(estimate: BlockchainResult<u64>, fallback: u64) -> u64 {
    match estimate {
        Ok(gas) => gas,
        Err(e) => {
            tracing::warn!(error = %e, fallback, "Gas estimation failed, using fallback limit");
            fallback
        }
    }
}

/// Reject quotes above the configured ceiling.
pub fn check_gas_cap(quote: &FeeQuote, max_gas_price_gwei: u64) -> BlockchainResult<()> {
    let current_gwei = quote.recorded_price() / GWEI;
    if current_gwei > max_gas_price_gwei as u128 {
        return Err(BlockchainError::GasPriceTooHigh {
            current_gwei: current_gwei as u64,
            max_gwei: max_gas_price_gwei,
        });
    }
    Ok(())
}

fn apply_fee(request: TransactionRequest, fee: FeeQuote) -> TransactionRequest {
    match fee {
        FeeQuote::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => request
            .with_max_fee_per_gas(max_fee_per_gas)
            .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
        FeeQuote::Legacy { gas_price } => request.with_gas_price(gas_price),
    }
}
