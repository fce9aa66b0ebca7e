//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the settlement
//! service. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the settlement service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SettlementConfig {
    /// Ledger database settings.
    pub database: DatabaseConfig,

    /// Blockchain integration settings.
    pub blockchain: BlockchainConfig,

    /// Queue worker pacing.
    pub queue: QueueConfig,

    /// Claim flow settings.
    pub claims: ClaimConfig,

    /// Custodial wallet storage.
    pub custody: CustodyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Ledger database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g., "sqlite://vouchers.db", "sqlite::memory:").
    pub url: String,

    /// Maximum pooled connections. Must stay 1 for in-memory databases.
    pub max_connections: u32,

    /// How long a writer waits for the database lock, in seconds.
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://vouchers.db".to_string(),
            max_connections: 1,
            busy_timeout_secs: 5,
        }
    }
}

/// Blockchain integration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockchainConfig {
    /// Enable blockchain integration.
    pub enabled: bool,

    /// JSON-RPC endpoint URL.
    pub rpc_url: String,

    /// Failover JSON-RPC endpoint URLs.
    #[serde(default)]
    pub failover_urls: Vec<String>,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 31337 for local Anvil).
    pub chain_id: u64,

    /// Address of the ERC-1155 voucher contract.
    pub contract_address: String,

    /// RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// How long to wait for a receipt before failing the transaction.
    pub receipt_timeout_secs: u64,

    /// Receipt polling interval in milliseconds.
    pub receipt_poll_interval_ms: u64,

    /// Priority tip for EIP-1559 transactions, in gwei.
    pub priority_fee_gwei: u64,

    /// Gas limit used when estimation fails.
    pub fallback_gas_limit: u64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: "http://localhost:8545".to_string(),
            failover_urls: Vec::new(),
            chain_id: 1,
            contract_address: String::new(),
            rpc_timeout_secs: 10,
            receipt_timeout_secs: 120,
            receipt_poll_interval_ms: 2000,
            priority_fee_gwei: 2,
            fallback_gas_limit: 200_000,
            max_gas_price_gwei: 500,
        }
    }
}

/// RPC round trips one submission can make: four mint-shape simulations,
/// two fee lookups, the gas estimate, the nonce and the broadcast.
pub const SUBMISSION_RPC_CALLS: u64 = 9;

impl BlockchainConfig {
    /// Worst case seconds a synchronous mint holds the ledger writer lock.
    pub fn sync_mint_budget_secs(&self, wait_for_receipt: bool) -> u64 {
        let endpoints = 1 + self.failover_urls.len() as u64;
        let rpc = self
            .rpc_timeout_secs
            .saturating_mul(SUBMISSION_RPC_CALLS)
            .saturating_mul(endpoints);
        if wait_for_receipt {
            rpc.saturating_add(self.receipt_timeout_secs)
        } else {
            rpc
        }
    }
}

/// Queue worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay between drain passes in seconds.
    pub poll_interval_secs: u64,

    /// Upper bound for the backoff applied while the chain is unreachable.
    pub max_backoff_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_backoff_secs: 300,
        }
    }
}

/// How a successful claim is settled on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// Enqueue an intent for the queue worker.
    Deferred,
    /// Mint inside the claim transaction.
    Immediate,
}

/// Claim flow configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Settlement mode for claims.
    pub settlement: SettlementMode,

    /// In immediate mode, wait for the receipt before committing.
    pub wait_for_receipt: bool,

    /// Maximum number of synchronous mints in flight. SQLite has a single
    /// writer, so values above 1 are clamped.
    pub max_concurrent_sync_mints: usize,

    /// Claim attempts allowed per email or IP inside the window (0 = unlimited).
    pub rate_limit_per_window: u32,

    /// Rate limit window in seconds.
    pub rate_limit_window_secs: u64,

    /// User agents longer than this are truncated in the audit trail.
    pub user_agent_max_len: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            settlement: SettlementMode::Deferred,
            wait_for_receipt: true,
            max_concurrent_sync_mints: 1,
            rate_limit_per_window: 0,
            rate_limit_window_secs: 600,
            user_agent_max_len: 200,
        }
    }
}

/// Custodial wallet configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Provider tag stored on custodial wallets.
    pub provider: String,

    /// Directory holding key records.
    pub store_dir: String,

    /// Whether key records are flagged as exportable.
    pub allow_export: bool,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            store_dir: "wallet_store".to_string(),
            allow_export: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

/// Placeholder admin key; validation rejects it when the admin API is enabled.
pub const PLACEHOLDER_ADMIN_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_ADMIN_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml() {
        let config: SettlementConfig = toml::from_str(
            r#"
            [blockchain]
            enabled = true
            chain_id = 31337
            contract_address = "0x5fbdb2315678afecb367f032d93f642f64180aa3"

            [claims]
            settlement = "immediate"
            "#,
        )
        .unwrap();

        assert!(config.blockchain.enabled);
        assert_eq!(config.blockchain.chain_id, 31337);
        assert_eq!(config.blockchain.receipt_timeout_secs, 120);
        assert_eq!(config.claims.settlement, SettlementMode::Immediate);
        assert_eq!(config.database.max_connections, 1);
        assert_eq!(config.queue.poll_interval_secs, 10);
    }

    #[test]
    fn test_defaults() {
        let config = SettlementConfig::default();
        assert!(!config.blockchain.enabled);
        assert_eq!(config.blockchain.fallback_gas_limit, 200_000);
        assert_eq!(config.claims.settlement, SettlementMode::Deferred);
        assert_eq!(config.claims.rate_limit_per_window, 0);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }
}
