//! Query Builder
//!
//! Filters (possibly nested across relations) in, parameterised SQL out.

pub mod builder;
pub mod filter;

pub use builder::{BuiltQuery, FindOptions, QueryBuilder, DEFAULT_LIMIT};
pub use filter::{Filter, FilterEntry};
