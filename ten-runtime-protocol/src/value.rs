//! The wire-serializable counterpart of `ten-runtime`'s `Value` tree.
//!
//! This mirrors the tagged-union value type from `spec.md` section 3 minus
//! the `ptr<opaque>` variant, which never crosses a wire: a locked buffer is
//! attached to a [`crate::WireEnvelope`] out of band, not serialized inline.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A property-tree value, the shape every `property.json` and message
/// property payload is made of.
///
/// `Object` uses an order-preserving map: `spec.md` requires merge operations
/// to preserve the ordering of the destination's keys, which a `BTreeMap`
/// cannot do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Buf(Vec<u8>),
    Array(Vec<WireValue>),
    Object(IndexMap<String, WireValue>),
}

impl Default for WireValue {
    fn default() -> Self {
        Self::Null
    }
}

impl WireValue {
    /// Shorthand for an empty object, the usual starting point for a property tree.
    pub fn empty_object() -> Self {
        Self::Object(IndexMap::new())
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, WireValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[WireValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_roundtrips_preserving_order() {
        let mut map = IndexMap::new();
        map.insert("b".to_owned(), WireValue::I64(1));
        map.insert("a".to_owned(), WireValue::I64(2));
        let value = WireValue::Object(map);

        let json = serde_json::to_string(&value).unwrap();
        let parsed: WireValue = serde_json::from_str(&json).unwrap();
        let parsed_map = parsed.as_object().unwrap();
        let keys: Vec<_> = parsed_map.keys().cloned().collect();
        assert_eq!(keys, vec!["b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn default_is_null() {
        assert!(WireValue::default().is_null());
    }
}
