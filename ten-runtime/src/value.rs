//! Typed tagged-union values with path-addressed get/set and merge, see `spec.md` section 3 and
//! the `ten_utils/value` supplement in `SPEC_FULL.md`.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::ValueError;

/// A non-owning handle into a caller-owned buffer, the `ptr<opaque>` variant.
///
/// Never serialized; a message that carries one must release it before its
/// owner's buffer is destroyed, see `spec.md` section 5 ("locked resources").
#[derive(Clone)]
pub struct OpaquePtr(pub Arc<dyn std::any::Any + Send + Sync>);

impl std::fmt::Debug for OpaquePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OpaquePtr(..)")
    }
}

impl PartialEq for OpaquePtr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The property-tree value type, see `spec.md` section 3.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Buf(Vec<u8>),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Ptr(OpaquePtr),
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

/// One parsed segment of a property path: either a field name or an array index.
#[derive(Debug, Clone, PartialEq)]
enum PathSegment<'a> {
    Field(&'a str),
    Index(usize),
}

/// Splits a path string like `a.b[2].c` into segments.
///
/// `.` separates field descents; `[n]` addresses an array index. A bare
/// leading segment (no `.` or `[`) is a field name too.
fn parse_path(path: &str) -> Result<Vec<PathSegment<'_>>, ValueError> {
    if path.is_empty() {
        return Err(ValueError::EmptyPath);
    }

    let mut segments = Vec::new();
    let mut rest = path;

    while !rest.is_empty() {
        if let Some(after_bracket) = rest.strip_prefix('[') {
            let end = after_bracket
                .find(']')
                .ok_or_else(|| ValueError::InvalidIndex(path.to_owned()))?;
            let (index_str, remainder) = after_bracket.split_at(end);
            let index: usize = index_str
                .parse()
                .map_err(|_| ValueError::InvalidIndex(path.to_owned()))?;
            segments.push(PathSegment::Index(index));
            rest = remainder
                .strip_prefix(']')
                .expect("split_at guarantees ']' at position 0");
            rest = rest.strip_prefix('.').unwrap_or(rest);
        } else {
            let end = rest
                .find(|c| c == '.' || c == '[')
                .unwrap_or(rest.len());
            let (field, remainder) = rest.split_at(end);
            segments.push(PathSegment::Field(field));
            rest = remainder.strip_prefix('.').unwrap_or(remainder);
        }
    }

    Ok(segments)
}

impl Value {
    /// Shorthand for an empty object, the usual root of a property tree.
    pub fn empty_object() -> Self {
        Self::Object(IndexMap::new())
    }

    /// Returns a borrow of the node addressed by `path`.
    ///
    /// See `spec.md` section 3: `.` descends into an object, `[n]` indexes an array.
    pub fn get_path(&self, path: &str) -> Result<&Value, ValueError> {
        let segments = parse_path(path)?;
        let mut node = self;
        for segment in segments {
            node = match (&segment, node) {
                (PathSegment::Field(name), Value::Object(map)) => map
                    .get(*name)
                    .ok_or_else(|| ValueError::NotFound(path.to_owned()))?,
                (PathSegment::Index(index), Value::Array(items)) => {
                    items.get(*index).ok_or(ValueError::IndexOutOfBounds {
                        index: *index,
                        len: items.len(),
                    })?
                }
                _ => return Err(ValueError::NotAContainer(path.to_owned())),
            };
        }
        Ok(node)
    }

    /// Writes `value` at `path`, creating intermediate containers as needed.
    ///
    /// The shape of a missing intermediate container is decided by the *next*
    /// path segment: an index creates an array, a field name creates an
    /// object, per `spec.md` section 3.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<(), ValueError> {
        let segments = parse_path(path)?;
        Self::set_segments(self, &segments, value)
    }

    fn set_segments(node: &mut Value, segments: &[PathSegment<'_>], value: Value) -> Result<(), ValueError> {
        let Some((first, rest)) = segments.split_first() else {
            *node = value;
            return Ok(());
        };

        match first {
            PathSegment::Field(name) => {
                if !matches!(node, Value::Object(_)) {
                    *node = Value::empty_object();
                }
                let Value::Object(map) = node else {
                    unreachable!("just normalized to Object");
                };
                if rest.is_empty() {
                    map.insert((*name).to_owned(), value);
                    return Ok(());
                }
                let entry = map
                    .entry((*name).to_owned())
                    .or_insert_with(|| Self::container_for(&rest[0]));
                Self::set_segments(entry, rest, value)
            }
            PathSegment::Index(index) => {
                if !matches!(node, Value::Array(_)) {
                    *node = Value::Array(Vec::new());
                }
                let Value::Array(items) = node else {
                    unreachable!("just normalized to Array");
                };
                while items.len() <= *index {
                    items.push(Value::Null);
                }
                if rest.is_empty() {
                    items[*index] = value;
                    return Ok(());
                }
                if !rest.is_empty() && matches!(items[*index], Value::Null) {
                    items[*index] = Self::container_for(&rest[0]);
                }
                Self::set_segments(&mut items[*index], rest, value)
            }
        }
    }

    fn container_for(segment: &PathSegment<'_>) -> Value {
        match segment {
            PathSegment::Field(_) => Value::empty_object(),
            PathSegment::Index(_) => Value::Array(Vec::new()),
        }
    }

    /// Merges `source` into `self`, cloning source subtrees and preserving the
    /// ordering of destination keys (new keys from `source` are appended),
    /// per `spec.md` section 3.
    pub fn merge(&mut self, source: &Value) {
        match (self, source) {
            (Value::Object(dest), Value::Object(src)) => {
                for (key, value) in src {
                    match dest.get_mut(key) {
                        Some(existing) => existing.merge(value),
                        None => {
                            dest.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            (dest, src) => {
                *dest = src.clone();
            }
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&ten_runtime_protocol::WireValue> for Value {
    fn from(wire: &ten_runtime_protocol::WireValue) -> Self {
        use ten_runtime_protocol::WireValue as W;
        match wire {
            W::Null => Value::Null,
            W::Bool(b) => Value::Bool(*b),
            W::I64(i) => Value::Int64(*i),
            W::U64(u) => Value::UInt64(*u),
            W::F64(f) => Value::Float64(*f),
            W::String(s) => Value::String(s.clone()),
            W::Buf(b) => Value::Buf(b.clone()),
            W::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
            W::Object(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for ten_runtime_protocol::WireValue {
    fn from(value: &Value) -> Self {
        use ten_runtime_protocol::WireValue as W;
        match value {
            Value::Null => W::Null,
            Value::Bool(b) => W::Bool(*b),
            Value::Int8(i) => W::I64(*i as i64),
            Value::Int16(i) => W::I64(*i as i64),
            Value::Int32(i) => W::I64(*i as i64),
            Value::Int64(i) => W::I64(*i),
            Value::UInt8(u) => W::U64(*u as u64),
            Value::UInt16(u) => W::U64(*u as u64),
            Value::UInt32(u) => W::U64(*u as u64),
            Value::UInt64(u) => W::U64(*u),
            Value::Float32(f) => W::F64(*f as f64),
            Value::Float64(f) => W::F64(*f),
            Value::String(s) => W::String(s.clone()),
            Value::Buf(b) => W::Buf(b.clone()),
            Value::Array(items) => W::Array(items.iter().map(ten_runtime_protocol::WireValue::from).collect()),
            Value::Object(map) => W::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), ten_runtime_protocol::WireValue::from(v)))
                    .collect(),
            ),
            // A ptr never crosses the wire; downgrade it to null rather than panic.
            Value::Ptr(_) => W::Null,
        }
    }
}
