//! Token operations consumed by the settlement layer.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use std::time::Duration;

use crate::blockchain::types::{BlockchainResult, SettledReceipt, Submission};

/// ERC-1155 operations on the configured voucher contract.
///
/// Implemented by [`Erc1155Client`](crate::blockchain::erc1155::Erc1155Client)
/// for a live node; tests substitute a scripted chain.
#[async_trait]
pub trait TokenChain: Send + Sync {
    /// Address that signs every submission.
    fn signer_address(&self) -> Address;

    /// Default wait used by callers that have no timeout of their own.
    fn receipt_timeout(&self) -> Duration;

    /// Read-only `balanceOf(owner, token_id)`.
    async fn balance_of(&self, owner: Address, token_id: U256) -> BlockchainResult<U256>;

    /// Mint `amount` of `token_id` to `to`.
    async fn mint_to(
        &self,
        to: Address,
        token_id: U256,
        amount: U256,
        data: Option<Bytes>,
    ) -> BlockchainResult<Submission>;

    /// `safeTransferFrom(from, to, ...)` signed by the platform signer.
    async fn safe_transfer(
        &self,
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
        data: Option<Bytes>,
    ) -> BlockchainResult<Submission>;

    /// Poll for a successful receipt.
    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> BlockchainResult<SettledReceipt>;

    /// Single receipt lookup; `None` while pending or unknown.
    async fn receipt(&self, tx_hash: TxHash) -> BlockchainResult<Option<SettledReceipt>>;

    /// Whether the node currently answers.
    async fn is_healthy(&self) -> bool;
}
