//! Balance ledger service subsystem.
//!
//! # Data Flow
//! ```text
//! ClaimOrchestrator / admin tooling
//!     → VoucherService
//!         → custody.rs (WalletProvisioner: custodial wallet on first need)
//!         → LedgerStore (credit / debit / enqueue in one transaction)
//!         → TokenChain (only on the synchronous mint path)
//! ```
//!
//! # Design Decisions
//! - One ledger transaction per business event
//! - Synchronous mints are bounded by a semaphore taken before the
//!   transaction opens, so waiting callers hold no database lock
//! - A failed synchronous mint rolls back its credit

pub mod custody;
pub mod service;

pub use custody::{CustodyError, LocalKeyStore, ProvisionedWallet, WalletProvisioner};
pub use service::{
    ClaimAllowance, CustodialWallet, ExportReceipt, ServiceError, VoucherService,
    SQLITE_WRITER_SLOTS,
};
