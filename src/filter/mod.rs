//! Request filtering subsystem.
//!
//! # Data Flow
//! ```text
//! startup:
//!     blocklist.rs (domain file) + inline config lists
//!     → FilterEngine::new (normalize, dedupe)
//!     → Arc<FilterEngine> shared by every connection
//!
//! per request:
//!     (host, path + query) → FilterEngine::evaluate → FilterDecision
//! ```
//!
//! # Design Decisions
//! - Rules are immutable after construction; no locks on the hot path
//! - Blocking is fail-closed: any match blocks
//! - Host matching covers the host itself and every parent domain

pub mod blocklist;
pub mod engine;

pub use blocklist::{load_domains, Blocklist, BlocklistError};
pub use engine::{BlockReason, FilterDecision, FilterEngine};
