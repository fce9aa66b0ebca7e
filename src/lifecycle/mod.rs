//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM / SIGINT → Shutdown::trigger()
//!
//! Shutdown (shutdown.rs):
//!     broadcast → settlement worker finishes its pass → admin API drains → exit
//! ```
//!
//! # Design Decisions
//! - A drain pass in progress is never interrupted mid-intent; the worker
//!   only observes shutdown between passes
//! - A second signal while shutting down exits immediately

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::watch_signals;
