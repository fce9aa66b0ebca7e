//! Loyalty voucher issuance and ERC-1155 settlement.
//!
//! Off-chain balances live in the ledger; every business event that must be
//! mirrored on-chain becomes an `onchain_tx` intent, settled by the queue
//! processor or minted synchronously by the voucher service.

// Core subsystems
pub mod blockchain;
pub mod config;
pub mod ledger;

// Business flows
pub mod claims;
pub mod settlement;
pub mod vouchers;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;

pub use config::SettlementConfig;
pub use ledger::{LedgerPool, LedgerStore};
pub use lifecycle::Shutdown;
