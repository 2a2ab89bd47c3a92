//! Storage Layer - SQLite-backed execution
//!
//! - `engine`: the single-connection worker and its read/write queue
//! - `adapter`: INSERT/UPDATE/DELETE assembly and result post-processing
//! - `stats`: write-queue counters for observers

pub mod adapter;
pub mod engine;
pub mod stats;

pub use adapter::Adapter;
pub use engine::{Database, RowSet, Statement};
pub use stats::{StatsObserver, StatsSnapshot, WriteStats};
