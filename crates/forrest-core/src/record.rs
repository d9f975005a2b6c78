//! # Records
//!
//! A record is an arbitrary JSON object. The sync layer only relies on two
//! fields:
//!
//! - `id`: unique within a collection (string or number on the wire)
//! - `upd` (or `updated`): last modification time, see [`Timestamp`]

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::time::Timestamp;

// =============================================================================
// Record Id
// =============================================================================

/// Identifier of a record within its collection.
///
/// Numeric ids are normalised to their decimal string so that `1` and `"1"`
/// address the same record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(String);

impl RecordId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id out of a JSON value. `null`, booleans, objects and empty
    /// strings are not ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(RecordId(s.clone())),
            Value::Number(n) => Some(RecordId(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(s)
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RecordIdVisitor)
    }
}

struct RecordIdVisitor;

impl<'de> Visitor<'de> for RecordIdVisitor {
    type Value = RecordId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-empty string or an integer id")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<RecordId, E> {
        if v.is_empty() {
            Err(E::custom("record id must not be empty"))
        } else {
            Ok(RecordId(v.to_string()))
        }
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordId, E> {
        Ok(RecordId(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordId, E> {
        Ok(RecordId(v.to_string()))
    }
}

// =============================================================================
// Record
// =============================================================================

/// A JSON object stored in a collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Record(Map::new())
    }

    /// Converts a JSON value into a record. Only objects are accepted.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Record(map)),
            other => Err(CoreError::NotAnObject(type_name(&other).to_string())),
        }
    }

    /// Returns the record id, if it has a usable one.
    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(RecordId::from_value)
    }

    /// Returns the record id or [`CoreError::MissingId`].
    pub fn require_id(&self) -> CoreResult<RecordId> {
        self.id().ok_or(CoreError::MissingId)
    }

    /// Returns the modification time from `upd`, falling back to `updated`.
    pub fn updated(&self) -> Option<Timestamp> {
        ["upd", "updated"]
            .iter()
            .filter_map(|field| self.0.get(*field))
            .find_map(|value| serde_json::from_value::<Timestamp>(value.clone()).ok())
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Builder-style [`Record::insert`].
    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    /// Borrows the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Record(map)
    }
}

/// Returns the greatest `upd` among `records`.
pub fn max_updated<'a>(records: impl IntoIterator<Item = &'a Record>) -> Option<Timestamp> {
    records.into_iter().filter_map(Record::updated).max()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
