//! Signer wallet and transaction signing.
//!
//! # Security
//! - The private key is loaded ONLY from an environment variable
//! - Keys are never logged or serialized

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::Address;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;

use crate::blockchain::types::{BlockchainError, BlockchainResult};

/// Environment variable name for the signer private key.
pub const SIGNER_KEY_ENV_VAR: &str = "VOUCHER_SIGNER_KEY";

/// The platform signer that mints and transfers vouchers.
#[derive(Clone)]
pub struct Wallet {
    /// Signing wallet wrapping the private key.
    inner: EthereumWallet,
    /// Cached signer address.
    address: Address,
    /// Chain ID for EIP-155 replay protection.
    chain_id: u64,
}

impl Wallet {
    /// Create a wallet from a hex-encoded private key (with or without `0x`).
    pub fn from_private_key(private_key_hex: &str, chain_id: u64) -> BlockchainResult<Self> {
        let key_hex = private_key_hex.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);

        let signer: PrivateKeySigner = key_hex
            .parse()
            .map_err(|e| BlockchainError::Wallet(format!("Invalid private key format: {}", e)))?;
        let address = signer.address();

        tracing::info!(address = %address, chain_id, "Signer wallet initialized");

        Ok(Self {
            inner: EthereumWallet::from(signer),
            address,
            chain_id,
        })
    }

    /// Load the signer from `VOUCHER_SIGNER_KEY`.
    pub fn from_env(chain_id: u64) -> BlockchainResult<Self> {
        match std::env::var(SIGNER_KEY_ENV_VAR) {
            Ok(key) if !key.trim().is_empty() => Self::from_private_key(&key, chain_id),
            _ => Err(BlockchainError::MissingSigner(SIGNER_KEY_ENV_VAR)),
        }
    }

    /// Get the wallet's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Get the chain ID this wallet is configured for.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign a fully populated request and return the EIP-2718 encoding ready
    /// for `eth_sendRawTransaction`.
    pub async fn sign_raw(&self, request: TransactionRequest) -> BlockchainResult<Vec<u8>> {
        let envelope = request
            .with_from(self.address)
            .with_chain_id(self.chain_id)
            .build(&self.inner)
            .await
            .map_err(|e| BlockchainError::Wallet(format!("Signing failed: {}", e)))?;
        Ok(envelope.encoded_2718())
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .finish()
    }
}
