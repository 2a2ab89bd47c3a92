//! # lightcrud - a lightweight entity mapper over SQLite
//!
//! Declare entity types once, then find, persist and delete them without
//! hand-writing SQL for the common cases.
//!
//! lightcrud provides:
//! - A schema registry of entity descriptors (fields, defaults, relations,
//!   indexes, versioned migrations, seed rows)
//! - A query builder that turns nested filter objects into joined,
//!   parameterised SELECTs
//! - An identity-mapped entity manager with dirty tracking
//! - A single-connection engine that batches statements, reads before writes

pub mod config;
pub mod entity;
pub mod query;
pub mod schema;
pub mod storage;
pub mod value;

// Re-exports for convenient access
pub use config::EngineConfig;
pub use entity::{Entity, EntityManager, Model, PersistAction, PersistOutcome};
pub use query::{Filter, FindOptions, QueryBuilder};
pub use schema::{EntityDescriptor, EntityType, Registry, Relation, RelationKind};
pub use storage::{Database, RowSet};
pub use value::{Row, Value};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Result type alias for lightcrud operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lightcrud operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Entity type not registered: {0}")]
    UnregisteredType(String),

    #[error("Unknown field '{field}' on entity {entity}")]
    UnknownField { entity: String, field: String },

    #[error("Entity {0} has no create statement")]
    MissingCreateStatement(String),

    #[error("Cannot resolve relation from {from} to {to}")]
    UnresolvableRelation { from: String, to: String },

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Primary key '{field}' of a stored {entity} cannot change")]
    PrimaryKeyChange { entity: String, field: String },

    #[error("Schema verification failed: {0}")]
    VerificationFailed(String),

    #[error("Migration {version} of {table} failed: {source}")]
    Migration {
        table: String,
        version: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Batch failed: {0}")]
    Batch(String),

    #[error("Database engine is closed")]
    EngineClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Fatal schema/configuration mistakes; retrying will not help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnregisteredType(_)
                | Error::UnknownField { .. }
                | Error::MissingCreateStatement(_)
                | Error::UnresolvableRelation { .. }
                | Error::InvalidDescriptor(_)
        )
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
