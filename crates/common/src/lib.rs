//! Shared configuration, errors, identifiers, memory accounting, and
//! observability primitives for the strata crates.
//!
//! Key modules:
//! - [`config`]: engine and spill settings
//! - [`error`]: the [`StrataError`] taxonomy
//! - [`memory`]: memory manager, per-operator pools, arbitration
//! - [`spill_stats`]: spill counters shared by spiller and operators
//! - [`metrics`]: prometheus registry

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;
pub mod spill_stats;

pub use config::{EngineConfig, SpillConfig, HASH_BITS};
pub use error::{Result, StrataError};
pub use ids::*;
pub use memory::{MemoryManager, MemoryPool, ReclaimableSectionGuard};
pub use metrics::{global_metrics, MetricsRegistry};
pub use spill_stats::SpillStats;
