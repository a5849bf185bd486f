//! Record type: the semantic payload that flows through the staging pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::staging::StagingError;

/// Largest canonical (stage 0) record accepted by the pipeline, in bytes.
///
/// Bounding the input keeps key derivation cheap and guarantees that every
/// string fits the symbolic stage's widest length header.
pub const MAX_RECORD_BYTES: usize = 16 * 1024;

/// An immutable structured payload tagged with a logical schema.
///
/// Field order is canonical (sorted by key), so two records built from the
/// same fields in any insertion order serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RecordParts")]
pub struct Record {
    schema: String,
    fields: Map<String, Value>,
}

#[derive(Deserialize)]
struct RecordParts {
    schema: String,
    fields: Map<String, Value>,
}

impl From<RecordParts> for Record {
    fn from(parts: RecordParts) -> Self {
        Record::new(parts.schema, parts.fields)
    }
}

/// Rebuild every object with its keys in sorted order.
fn sorted_map(map: Map<String, Value>) -> Map<String, Value> {
    let mut entries: Vec<(String, Value)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .into_iter()
        .map(|(k, v)| (k, sorted_value(v)))
        .collect()
}

fn sorted_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sorted_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sorted_value).collect()),
        other => other,
    }
}

impl Record {
    /// Build a record from a schema tag and its fields.
    pub fn new(schema: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            schema: schema.into(),
            fields: sorted_map(fields),
        }
    }

    /// Build a record from a JSON value shaped as `{"schema": .., "fields": {..}}`.
    pub fn from_value(value: Value) -> Result<Self, StagingError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a record from its canonical JSON bytes.
    pub fn from_canonical(bytes: &[u8]) -> Result<Self, StagingError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Logical schema tag.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Record fields, sorted by key.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up one field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Canonical compact JSON encoding (stage 0).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, StagingError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Size of the canonical encoding in bytes.
    pub fn byte_size(&self) -> usize {
        self.canonical_bytes().map(|b| b.len()).unwrap_or(0)
    }

    /// Maximum nesting depth of the field tree (a flat record has depth 1).
    pub fn depth(&self) -> usize {
        fn value_depth(value: &Value) -> usize {
            match value {
                Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
                Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
                _ => 0,
            }
        }
        1 + self.fields.values().map(value_depth).max().unwrap_or(0)
    }

    /// Total number of leaf and container values in the field tree.
    pub fn fan_out(&self) -> usize {
        fn count(value: &Value) -> usize {
            match value {
                Value::Array(items) => 1 + items.iter().map(count).sum::<usize>(),
                Value::Object(map) => 1 + map.values().map(count).sum::<usize>(),
                _ => 1,
            }
        }
        self.fields.values().map(count).sum()
    }
}
