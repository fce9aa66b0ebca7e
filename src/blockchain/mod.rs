//! Blockchain integration subsystem.
//!
//! # Data Flow
//! ```text
//! VOUCHER_SIGNER_KEY (environment)
//!     → wallet.rs (key loading, signing)
//!     → client.rs (RPC with failover and timeouts)
//!     → transaction.rs (fees, gas, nonce lease, broadcast, receipt polling)
//!         → nonce.rs (one lease per submission)
//!     → erc1155.rs (mint shape probing, safe transfer)
//!     → TokenChain (trait consumed by settlement and vouchers)
//! ```
//!
//! # Security Constraints
//! - Private keys ONLY from environment variables
//! - Never log private keys or sensitive data
//! - All RPC calls have configurable timeouts
//! - A chain id mismatch is fatal; an unreachable node is not

pub mod client;
pub mod erc1155;
pub mod nonce;
pub mod token;
pub mod transaction;
pub mod types;
pub mod wallet;

pub use client::BlockchainClient;
pub use erc1155::{Erc1155Client, MintShape};
pub use nonce::NonceAllocator;
pub use token::TokenChain;
pub use transaction::TxSender;
pub use types::{
    hash_hex, BlockchainConfig, BlockchainError, BlockchainResult, ChainId, FeeQuote,
    SettledReceipt, Submission,
};
pub use wallet::{Wallet, SIGNER_KEY_ENV_VAR};
