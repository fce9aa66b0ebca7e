//! Custodial wallet provisioning.
//!
//! The ledger only needs an address and an opaque reference per wallet.
//! [`LocalKeyStore`] keeps one JSON key record per wallet on local disk,
//! readable only by the owning user on unix.

use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::CustodyConfig;
use crate::ledger::types::{now_secs, WalletAddress};

/// Errors raised by a wallet provisioner.
#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("Key store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Invalid provider reference '{0}'")]
    InvalidReference(String),
}

/// What the ledger records about a freshly created wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWallet {
    pub address: WalletAddress,
    pub provider_ref: String,
    pub exportable: bool,
}

/// Creates custodial wallets for users.
#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    /// Provider tag stored on every wallet this provisioner creates.
    fn provider(&self) -> &str;

    async fn create_wallet(&self, user_id: Uuid) -> Result<ProvisionedWallet, CustodyError>;
}

/// On-disk key record.
#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    provider: String,
    user_id: Uuid,
    chain_id: u64,
    address: String,
    private_key: String,
    exportable: bool,
    created_at: i64,
}

/// File-backed key store: `<store_dir>/<provider_ref>.json`.
#[derive(Debug, Clone)]
pub struct LocalKeyStore {
    dir: PathBuf,
    provider: String,
    chain_id: u64,
    exportable: bool,
}

impl LocalKeyStore {
    pub fn new(config: &CustodyConfig, chain_id: u64) -> Self {
        Self {
            dir: PathBuf::from(&config.store_dir),
            provider: config.provider.clone(),
            chain_id,
            exportable: config.allow_export,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, provider_ref: &str) -> Result<PathBuf, CustodyError> {
        let valid = (16..=64).contains(&provider_ref.len())
            && provider_ref.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(CustodyError::InvalidReference(provider_ref.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", provider_ref)))
    }

    /// Load a record's address, e.g. to verify a wallet row.
    pub async fn address_of(&self, provider_ref: &str) -> Result<WalletAddress, CustodyError> {
        let path = self.record_path(provider_ref)?;
        let blob = tokio::fs::read(&path).await?;
        let record: KeyRecord = serde_json::from_slice(&blob)?;
        WalletAddress::parse(&record.address)
            .map_err(|_| CustodyError::InvalidReference(provider_ref.to_string()))
    }
}

#[async_trait]
impl WalletProvisioner for LocalKeyStore {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn create_wallet(&self, user_id: Uuid) -> Result<ProvisionedWallet, CustodyError> {
        let signer = PrivateKeySigner::random();
        let address = WalletAddress(signer.address());
        let provider_ref = alloy::hex::encode(rand::thread_rng().gen::<[u8; 16]>());

        let record = KeyRecord {
            provider: self.provider.clone(),
            user_id,
            chain_id: self.chain_id,
            address: address.to_hex(),
            private_key: alloy::hex::encode(signer.to_bytes()),
            exportable: self.exportable,
            created_at: now_secs(),
        };
        let blob = serde_json::to_vec_pretty(&record)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&provider_ref)?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(&blob).await?;
        file.sync_all().await?;

        tracing::info!(
            user_id = %user_id,
            address = %address,
            provider = %self.provider,
            "Custodial wallet created"
        );

        Ok(ProvisionedWallet {
            address,
            provider_ref,
            exportable: self.exportable,
        })
    }
}
