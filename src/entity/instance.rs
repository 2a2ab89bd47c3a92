//! Entity instances
//!
//! An [`Entity`] holds two value maps: `committed` (last known persisted
//! state) and `dirty` (pending changes). Reads prefer dirty over committed.
//! The handle is shared: clones point at the same live instance, which is
//! what the identity cache hands out.

use crate::lock;
use crate::schema::EntityDescriptor;
use crate::value::{Row, Value};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    committed: Row,
    dirty: Row,
}

#[derive(Clone)]
pub struct Entity {
    descriptor: Arc<EntityDescriptor>,
    state: Arc<Mutex<State>>,
}

impl Entity {
    /// Empty, unsaved instance.
    pub(crate) fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        Self {
            descriptor,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Clean instance populated from a stored row.
    pub(crate) fn from_row(descriptor: Arc<EntityDescriptor>, row: Row) -> Self {
        Self {
            descriptor,
            state: Arc::new(Mutex::new(State {
                committed: row,
                dirty: Row::new(),
            })),
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn entity_type(&self) -> &str {
        &self.descriptor.name
    }

    /// Persisted primary key, if any.
    pub fn primary_key(&self) -> Option<Value> {
        lock(&self.state)
            .committed
            .get(&self.descriptor.primary)
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// True until the instance has been persisted (or after it was deleted).
    pub fn is_new(&self) -> bool {
        self.primary_key().is_none()
    }

    /// Current value of `field`: dirty first, then committed, else `Null`.
    pub fn get(&self, field: &str) -> Value {
        let state = lock(&self.state);
        state
            .dirty
            .get(field)
            .or_else(|| state.committed.get(field))
            .cloned()
            .unwrap_or_default()
    }

    /// Stage a change. Returns whether the visible value changed.
    ///
    /// Writing the visible value again is a no-op, and writing back the
    /// committed value drops the pending change. The primary key of a
    /// persisted instance cannot be changed.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<bool> {
        if !self.descriptor.has_field(field) {
            return Err(Error::UnknownField {
                entity: self.descriptor.name.clone(),
                field: field.to_string(),
            });
        }
        let value = value.into();
        let mut state = lock(&self.state);

        let visible = state
            .dirty
            .get(field)
            .or_else(|| state.committed.get(field))
            .cloned()
            .unwrap_or_default();
        if visible.same_as(&value) {
            return Ok(false);
        }
        if field == self.descriptor.primary && state.committed.get(field).is_some_and(|pk| !pk.is_null()) {
            return Err(Error::PrimaryKeyChange {
                entity: self.descriptor.name.clone(),
                field: field.to_string(),
            });
        }

        let committed = state.committed.get(field).cloned().unwrap_or_default();
        if committed.same_as(&value) {
            state.dirty.remove(field);
        } else {
            state.dirty.insert(field.to_string(), value);
        }
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        !lock(&self.state).dirty.is_empty()
    }

    pub fn dirty_fields(&self) -> Vec<String> {
        lock(&self.state).dirty.keys().cloned().collect()
    }

    pub fn dirty_values(&self) -> Row {
        lock(&self.state).dirty.clone()
    }

    pub fn committed_values(&self) -> Row {
        lock(&self.state).committed.clone()
    }

    /// Visible values: committed overlaid with dirty.
    pub fn values(&self) -> Row {
        let state = lock(&self.state);
        let mut values = state.committed.clone();
        values.extend(state.dirty.iter().map(|(k, v)| (k.clone(), v.clone())));
        values
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.values().into_iter().map(|(k, v)| (k, v.to_json())).collect())
    }

    /// Whether `other` is the same live instance.
    pub fn same_instance(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Values an INSERT should carry: non-null visible values.
    pub(crate) fn insert_values(&self) -> Row {
        self.values().into_iter().filter(|(_, v)| !v.is_null()).collect()
    }

    /// Fold a freshly read row into committed state. Pending changes that
    /// the row already reflects are dropped; others stay pending.
    pub(crate) fn merge_committed(&self, row: Row) {
        let mut state = lock(&self.state);
        for (field, value) in row {
            if state.dirty.get(&field).is_some_and(|pending| pending.same_as(&value)) {
                state.dirty.remove(&field);
            }
            state.committed.insert(field, value);
        }
    }

    /// Record a successful write of `written`. Changes staged after the
    /// snapshot was taken stay dirty.
    pub(crate) fn commit(&self, written: &Row, primary: Option<Value>) {
        let mut state = lock(&self.state);
        for (field, value) in written {
            if state.dirty.get(field).is_some_and(|pending| pending.same_as(value)) {
                state.dirty.remove(field);
            }
            state.committed.insert(field.clone(), value.clone());
        }
        if let Some(primary) = primary {
            state.dirty.remove(&self.descriptor.primary);
            state.committed.insert(self.descriptor.primary.clone(), primary);
        }
    }

    pub(crate) fn clear_primary_key(&self) {
        let mut state = lock(&self.state);
        state.dirty.remove(&self.descriptor.primary);
        state.committed.insert(self.descriptor.primary.clone(), Value::Null);
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Entity")
            .field("type", &self.descriptor.name)
            .field("committed", &state.committed)
            .field("dirty", &state.dirty)
            .finish()
    }
}
