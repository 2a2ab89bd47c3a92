//! Typed models
//!
//! A model wraps an [`Entity`] and adds domain methods on top of the generic
//! `get`/`set` pair. Every model shares the same persistence surface through
//! the wrapped entity.

use super::instance::Entity;
use crate::schema::EntityDescriptor;

pub trait Model: Sized {
    /// Registered entity type name
    const ENTITY: &'static str;

    fn descriptor() -> EntityDescriptor;

    fn from_entity(entity: Entity) -> Self;

    fn entity(&self) -> &Entity;
}
