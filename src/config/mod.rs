//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! settlement.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SettlementConfig (validated, immutable)
//!     → handed to each subsystem at construction
//!
//! Environment (never in the file):
//!     VOUCHER_SIGNER_KEY      → blockchain::Wallet
//!     VOUCHER_IP_HASH_SECRET  → claims::audit
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, resolve_config, ConfigError};
pub use schema::{
    AdminConfig, BlockchainConfig, ClaimConfig, CustodyConfig, DatabaseConfig, LogFormat,
    ObservabilityConfig, QueueConfig, SettlementConfig, SettlementMode,
};
