//! Variable scopes — last-write-wins key/value stores.
//!
//! A run carries four scopes (environment, globals, collection, locals).
//! Partitioned lanes own independent clones of all four; nothing is
//! shared, and cross-lane visibility only happens through an explicit
//! merge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A flat key/value variable store with last-write-wins semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableScope {
    values: HashMap<String, JsonValue>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        self.values.insert(key.into(), value);
    }

    /// Get a variable by key.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    /// Remove a variable, returning its previous value.
    pub fn unset(&mut self, key: &str) -> Option<JsonValue> {
        self.values.remove(key)
    }

    /// Copy every entry of `other` into this scope (last write wins).
    pub fn merge(&mut self, other: &VariableScope) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over entries (unordered).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.values.iter()
    }
}

impl FromIterator<(String, JsonValue)> for VariableScope {
    fn from_iter<T: IntoIterator<Item = (String, JsonValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// The four variable scopes a run (or a lane) owns.
///
/// `Clone` produces fully independent copies; this is the only cloning a
/// lane needs to be isolated from its siblings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSet {
    pub environment: VariableScope,
    pub globals: VariableScope,
    pub collection: VariableScope,
    pub locals: VariableScope,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every scope of `other` into this set, key by key.
    pub fn merge_from(&mut self, other: &ScopeSet) {
        self.environment.merge(&other.environment);
        self.globals.merge(&other.globals);
        self.collection.merge(&other.collection);
        self.locals.merge(&other.locals);
    }
}
