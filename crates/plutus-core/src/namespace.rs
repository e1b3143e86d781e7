//! A typed, whitelisted view over a single root-level map container.
//!
//! This is the surface application code actually touches: the raw
//! [`crate::replica::Replica`] hands out containers, but agents are meant to
//! read and write through a `Namespace`, which rejects values outside the
//! closed [`PlutusValue`] shape before they ever reach the CRDT engine.

use std::collections::BTreeMap;

use loro::LoroMap;

use crate::error::{PlutusError, PlutusResult};
use crate::value::PlutusValue;

/// A validated view over one root-level map container.
pub struct Namespace {
    map: LoroMap,
}

impl Namespace {
    pub fn new(map: LoroMap) -> Self {
        Namespace { map }
    }

    /// Read a key. Returns `None` if the key is absent.
    pub fn get(&self, key: &str) -> Option<PlutusValue> {
        self.map
            .get(key)
            .map(|v| PlutusValue::from_loro(&v.get_deep_value()))
    }

    /// Write a key, rejecting values outside the supported recursive shape.
    pub fn set(&self, key: &str, value: impl Into<PlutusValue>) -> PlutusResult<()> {
        let value = value.into();
        if !value.is_supported() {
            return Err(PlutusError::Value(format!(
                "value for key '{key}' is outside the supported shape"
            )));
        }
        self.map
            .insert(key, value.to_loro())
            .map_err(|e| PlutusError::Value(format!("failed to write key '{key}': {e}")))
    }

    /// Delete a key. No-op if the key was absent.
    pub fn delete(&self, key: &str) -> PlutusResult<()> {
        self.map
            .delete(key)
            .map_err(|e| PlutusError::Value(format!("failed to delete key '{key}': {e}")))
    }

    /// Whether the namespace currently has the given key.
    pub fn contains(&self, key: &str) -> bool {
        self.map.get(key).is_some()
    }

    /// All keys currently present, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.map.keys().map(|k| k.to_string()).collect()
    }

    /// All values currently present, in the same order as [`Namespace::keys`].
    pub fn values(&self) -> Vec<PlutusValue> {
        self.map
            .values()
            .map(|v| PlutusValue::from_loro(&v.get_deep_value()))
            .collect()
    }

    /// Every key/value pair currently present.
    pub fn items(&self) -> Vec<(String, PlutusValue)> {
        self.keys()
            .into_iter()
            .filter_map(|k| self.get(&k).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Snapshot the namespace into an owned map.
    pub fn to_dict(&self) -> BTreeMap<String, PlutusValue> {
        self.items().into_iter().collect()
    }

    /// Number of keys currently present.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the namespace currently has no keys.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
