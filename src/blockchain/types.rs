//! Chain-specific types and error definitions.

use alloy::primitives::{utils::format_units, TxHash, U256};
use thiserror::Error;

// Re-export BlockchainConfig from config module to avoid duplication
pub use crate::config::schema::BlockchainConfig;

/// Chain ID type for strong typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub u64);

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChainId> for u64 {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

/// Errors that can occur during blockchain operations.
#[derive(Debug, Error)]
pub enum BlockchainError {
    /// The node answered with an error, or the answer could not be decoded.
    #[error("Chain query failed: {0}")]
    ChainQuery(String),

    /// No configured endpoint could be reached.
    #[error("Chain connection failed: {0}")]
    ChainConnection(String),

    /// RPC request timed out.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// Every known mint function shape failed.
    #[error("Unable to mint via available signatures: {}", .0.join("; "))]
    MintUnsupported(Vec<String>),

    /// No receipt appeared within the wait window.
    #[error("Timed out after {secs}s waiting for receipt of {tx_hash}")]
    ReceiptTimeout { tx_hash: TxHash, secs: u64 },

    /// Transaction was mined with failure status.
    #[error("Transaction {tx_hash} reverted on-chain")]
    Reverted { tx_hash: TxHash },

    /// Invalid private key format or signing failure.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Signer key absent from the environment.
    #[error("Signer key not configured: set {0}")]
    MissingSigner(&'static str),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Nonce management error.
    #[error("Nonce error: {0}")]
    Nonce(String),

    /// Chain configuration mismatch.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// Blockchain client not initialized or disabled.
    #[error("Blockchain not available: {0}")]
    NotAvailable(String),
}

/// Result type for blockchain operations.
pub type BlockchainResult<T> = Result<T, BlockchainError>;

/// Fee fields chosen for one submission, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeQuote {
    /// Priority-fee transaction for networks reporting a base fee.
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    /// Legacy transaction at the node's suggested price.
    Legacy { gas_price: u128 },
}

impl FeeQuote {
    /// Per-gas price recorded for settlement: the max fee when present,
    /// otherwise the legacy gas price.
    pub fn recorded_price(&self) -> u128 {
        match self {
            FeeQuote::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
            FeeQuote::Legacy { gas_price } => *gas_price,
        }
    }

    /// Recorded price rendered in native units (18 decimals).
    pub fn recorded_price_native(&self) -> String {
        let wei = U256::from(self.recorded_price());
        format_units(wei, "ether").unwrap_or_else(|_| wei.to_string())
    }
}

/// A broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: TxHash,
    pub nonce: u64,
    pub fee: FeeQuote,
}

/// A successful receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// Lowercase `0x` + 64 hex rendering of a transaction hash.
pub fn hash_hex(hash: &TxHash) -> String {
    format!("{:#x}", hash)
}
