//! Ledger store subsystem.
//!
//! # Data Flow
//! ```text
//! VoucherService / ClaimOrchestrator / QueueProcessor
//!     → LedgerStore::begin()            (BEGIN IMMEDIATE, writer lock)
//!     → get_balance_for_update()        (row created at zero if absent)
//!     → credit() / debit()              (balance + voucher_transfer_log row)
//!     → enqueue_intent() / advance()    (onchain_tx state machine)
//!     → commit / rollback by the caller
//! ```
//!
//! # Design Decisions
//! - Balances never go negative; the schema CHECK backs the debit check
//! - `voucher_transfer_log` is append-only
//! - `onchain_tx` status moves only along queued → sent → confirmed, with
//!   `failed` reachable from queued and sent; both ends are terminal
//! - Amounts are positive integers; token ids are decimal strings up to 2^256-1
//! - Claim codes and the claim-request audit share the database so code
//!   consumption commits with the credit it pays for

pub mod claims;
pub mod pool;
pub mod store;
pub mod types;

pub use claims::{ClaimCode, ClaimRequest, ClaimRequestRecord};
pub use pool::LedgerPool;
pub use store::{Debit, LedgerStore, Tx};
pub use types::{
    LedgerError, LedgerResult, NewVoucherType, NewWallet, OnchainTx, TokenId, TransferLogEntry,
    TransferReason, Transition, TxKind, TxStatus, VoucherType, Wallet, WalletAddress,
    EXTERNAL_PROVIDER,
};
