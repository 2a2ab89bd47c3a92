//! Entity Manager - live instances over the store
//!
//! - `instance`: committed/dirty value maps behind a shared handle
//! - `cache`: one live instance per (type, primary key)
//! - `manager`: find, persist, delete, raw execution
//! - `migrate` / `markers`: startup verification and version tracking
//! - `model`: typed wrappers with domain methods

pub mod cache;
pub mod instance;
pub mod manager;
pub mod markers;
pub mod migrate;
pub mod model;

pub use cache::IdentityCache;
pub use instance::Entity;
pub use manager::{EntityManager, PersistAction, PersistOutcome};
pub use markers::{marker_key, MemoryMarkers, SqliteMarkers, VersionMarkers};
pub use migrate::{Migrator, VerifyReport};
pub use model::Model;
