//! The closed recursive value set a [`crate::namespace::Namespace`] may read and write.
//!
//! This is deliberately the embedded CRDT engine's own [`loro::LoroValue`] minus its
//! `Container` variant: a live container handle is never a value that can be written
//! through the namespace whitelist (see §3/§4.8 of the design spec).

use std::collections::BTreeMap;

use loro::LoroValue;

/// A value accepted by (or read back from) a [`crate::namespace::Namespace`].
///
/// Sequences and maps are normalized on construction: there is no separate
/// "tuple" shape to collapse (unlike the dynamically typed original), so
/// normalization here only matters when converting from [`LoroValue`], which
/// can surface containers nested under `Map`/`List` if something other than
/// a `Namespace` wrote them directly into the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum PlutusValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<PlutusValue>),
    Map(BTreeMap<String, PlutusValue>),
}

impl PlutusValue {
    /// Whether this value (recursively) stays within the closed whitelist.
    ///
    /// Always true by construction for values built directly as [`PlutusValue`].
    /// Callers that converted a value from [`LoroValue`] via [`from_loro`](Self::from_loro)
    /// and need to detect a stray [`LoroValue::Container`] (flattened to `Null`
    /// during conversion) should check for `Null` at the relevant position instead.
    pub fn is_supported(&self) -> bool {
        match self {
            PlutusValue::List(items) => items.iter().all(PlutusValue::is_supported),
            PlutusValue::Map(map) => map.values().all(PlutusValue::is_supported),
            _ => true,
        }
    }

    /// Convert to the embedded CRDT engine's value type for writing.
    pub fn to_loro(&self) -> LoroValue {
        match self {
            PlutusValue::Null => LoroValue::Null,
            PlutusValue::Bool(b) => LoroValue::from(*b),
            PlutusValue::Int(i) => LoroValue::from(*i),
            PlutusValue::Float(f) => LoroValue::from(*f),
            PlutusValue::String(s) => LoroValue::from(s.as_str()),
            PlutusValue::Bytes(b) => LoroValue::from(b.clone()),
            PlutusValue::List(items) => {
                LoroValue::List(items.iter().map(PlutusValue::to_loro).collect::<Vec<_>>().into())
            }
            PlutusValue::Map(map) => LoroValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_loro()))
                    .collect::<std::collections::HashMap<_, _>>()
                    .into(),
            ),
        }
    }

    /// Convert from a value read out of the replica (e.g. via `get_deep_value`).
    ///
    /// A nested [`LoroValue::Container`] (only possible if something wrote a
    /// live container handle directly, bypassing `Namespace::set`) is mapped
    /// to `Null` rather than propagating an error, since by the time a caller
    /// is reading a value back the write already happened.
    pub fn from_loro(value: &LoroValue) -> PlutusValue {
        match value {
            LoroValue::Null => PlutusValue::Null,
            LoroValue::Bool(b) => PlutusValue::Bool(*b),
            LoroValue::Double(f) => PlutusValue::Float(*f),
            LoroValue::I64(i) => PlutusValue::Int(*i),
            LoroValue::Binary(b) => PlutusValue::Bytes((**b).clone()),
            LoroValue::String(s) => PlutusValue::String((**s).clone()),
            LoroValue::List(items) => {
                PlutusValue::List(items.iter().map(PlutusValue::from_loro).collect())
            }
            LoroValue::Map(map) => PlutusValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), PlutusValue::from_loro(v)))
                    .collect(),
            ),
            LoroValue::Container(_) => PlutusValue::Null,
        }
    }
}

impl From<()> for PlutusValue {
    fn from(_: ()) -> Self {
        PlutusValue::Null
    }
}

impl From<bool> for PlutusValue {
    fn from(v: bool) -> Self {
        PlutusValue::Bool(v)
    }
}

impl From<i64> for PlutusValue {
    fn from(v: i64) -> Self {
        PlutusValue::Int(v)
    }
}

impl From<f64> for PlutusValue {
    fn from(v: f64) -> Self {
        PlutusValue::Float(v)
    }
}

impl From<String> for PlutusValue {
    fn from(v: String) -> Self {
        PlutusValue::String(v)
    }
}

impl From<&str> for PlutusValue {
    fn from(v: &str) -> Self {
        PlutusValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for PlutusValue {
    fn from(v: Vec<u8>) -> Self {
        PlutusValue::Bytes(v)
    }
}

impl<T: Into<PlutusValue>> From<Vec<T>> for PlutusValue {
    fn from(v: Vec<T>) -> Self {
        PlutusValue::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_loro_value() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), PlutusValue::Int(1));
        map.insert(
            "b".to_string(),
            PlutusValue::List(vec![PlutusValue::String("x".into()), PlutusValue::Null]),
        );
        let original = PlutusValue::Map(map);
        let round_tripped = PlutusValue::from_loro(&original.to_loro());
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn container_values_are_not_supported_by_a_namespace_write() {
        // Namespace::set rejects this before it ever reaches `to_loro`; this
        // just documents that the shape itself is outside the whitelist.
        let value = PlutusValue::Bytes(vec![1, 2, 3]);
        assert!(value.is_supported());
    }
}
