//! The record data model: business records, envelopes, and anchors.
//!
//! Every record that crosses a stream boundary carries a framework-owned
//! physical index under the reserved key `_i`, called the *anchor*. The
//! anchor is attached on write (*boxing*) and stripped before user
//! operators see the record (*unboxing*), so operators only ever observe
//! business fields.

use serde_json::{Map, Value};

use crate::error::StreamError;

/// The reserved envelope key carrying the physical index.
pub const ANCHOR_KEY: &str = "_i";

/// Anchor space reserved per parent for 1:N child records.
///
/// A child of parent `p` with ordinal `j` is anchored at
/// `p * CHILD_SPAN + j` (a 4-digit child suffix). Operators emitting
/// fewer than `CHILD_SPAN` children per parent can never collide
/// across parents.
pub const CHILD_SPAN: u64 = 10_000;

/// The framework-owned physical index of a record within a stream.
pub type Anchor = u64;

/// Derives the anchor of the `ordinal`-th child of `parent`.
#[must_use]
pub fn child_anchor(parent: Anchor, ordinal: u64) -> Anchor {
    debug_assert!(ordinal < CHILD_SPAN, "child ordinal overflows anchor span");
    parent * CHILD_SPAN + ordinal
}

/// A business record: the mapping user operators read and produce.
///
/// A `Record` never contains the anchor key; boxing and unboxing are the
/// only places the envelope is attached or stripped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Record(Map::new())
    }

    /// Creates a record from a JSON object map, dropping any embedded
    /// anchor key. The anchor is framework-owned; a user-supplied value
    /// is discarded rather than trusted.
    #[must_use]
    pub fn from_map(mut fields: Map<String, Value>) -> Self {
        fields.remove(ANCHOR_KEY);
        Record(fields)
    }

    /// Returns the value of a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sets a field, returning the record for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets a field in place. The anchor key is silently ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key != ANCHOR_KEY {
            self.0.insert(key, value.into());
        }
    }

    /// Returns the number of business fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the business fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Consumes the record, returning the underlying map.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Borrows the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Record::from_map(fields)
    }
}

/// A boxed record: anchor plus business fields, the wire form of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The physical index of this record within its stream.
    pub anchor: Anchor,
    /// The business record.
    pub record: Record,
}

impl Envelope {
    /// Boxes a record under the given anchor.
    #[must_use]
    pub fn new(anchor: Anchor, record: Record) -> Self {
        Envelope { anchor, record }
    }

    /// Serializes to the flat wire object: `_i` as a sibling of the
    /// business fields, no nested envelope.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::with_capacity(self.record.len() + 1);
        obj.insert(ANCHOR_KEY.to_string(), Value::from(self.anchor));
        for (k, v) in self.record.iter() {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }

    /// Parses the flat wire object back into an envelope.
    ///
    /// A missing or non-integer `_i` falls back to `ordinal`: the input
    /// boundary assigns anchors equal to the row ordinal, so raw input
    /// files without an anchor column are admissible.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Malformed`] if the value is not a JSON object.
    pub fn from_json(value: Value, ordinal: u64) -> Result<Self, StreamError> {
        let Value::Object(mut obj) = value else {
            return Err(StreamError::Malformed {
                ordinal,
                detail: "expected a JSON object".into(),
            });
        };
        let anchor = obj
            .remove(ANCHOR_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(ordinal);
        Ok(Envelope {
            anchor,
            record: Record::from_map(obj),
        })
    }
}
