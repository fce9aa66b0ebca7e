//! Claim orchestrator subsystem.
//!
//! # Data Flow
//! ```text
//! claim(user, Code | Slug, context)
//!     → rate limit (claim_request rows by email or IP hash in the window)
//!     → BEGIN IMMEDIATE
//!         → code exists and is unused → not expired → voucher active
//!         → per-user limit → consume code
//!         → deferred:  credit + queue mint1155
//!           immediate: credit + mint now (semaphore permit held)
//!     → COMMIT (or rollback on any rejection or failure)
//!     → claim_request audit row with the outcome
//! ```

pub mod audit;
pub mod orchestrator;

pub use audit::{ClaimAuditor, IP_HASH_SECRET_ENV_VAR};
pub use orchestrator::{
    ClaimContext, ClaimError, ClaimOrchestrator, ClaimOutcome, ClaimReceipt, ClaimTarget,
};
