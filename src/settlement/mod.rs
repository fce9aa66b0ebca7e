//! On-chain settlement subsystem.
//!
//! # Data Flow
//! ```text
//! SettlementWorker (every queue.poll_interval_secs, backoff while unhealthy)
//!   or `voucher-settlement drain` / POST /admin/drain
//!     → QueueProcessor::drain_once()
//!         → oldest queued onchain_tx
//!         → resolve voucher type + wallet
//!         → TokenChain::mint_to / safe_transfer   → advance(sent)
//!         → TokenChain::wait_for_receipt          → advance(confirmed)
//!         → any error                             → advance(failed, last_error)
//! ```
//!
//! # Design Decisions
//! - Strictly sequential: one intent in flight per drain
//! - No automatic retry; operators requeue failed rows
//! - Ledger connections are released while waiting on the chain
//! - Status writes retry while the SQLite writer lock is busy; a broadcast
//!   that still cannot be recorded halts the processor until restart

pub mod processor;
pub mod worker;

pub use processor::{DrainReport, LandedFailure, ProcessError, QueueProcessor, WriteRetry};
pub use worker::SettlementWorker;
