//! Built-in in-process backends.
//!
//! Both classify the operation primitives a query mentions into their
//! categories. [`ShapeBackend`] only inspects the `operation` field of shallow
//! queries; [`AnalysisBackend`] walks the whole field tree.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::compute::backend::{ComputeBackend, Computation, ComputeError};
use crate::router::ExecutionRequest;
use crate::staging::Record;

/// Schema tag of every answer record.
pub const ANSWER_SCHEMA: &str = "answer";

const PRIMITIVES: &[(&str, &str)] = &[
    ("CREATE", "crud"),
    ("READ", "crud"),
    ("UPDATE", "crud"),
    ("DELETE", "crud"),
    ("SEND", "communication"),
    ("RECEIVE", "communication"),
    ("TRANSFORM", "communication"),
    ("VALIDATE", "communication"),
    ("BRANCH", "control"),
    ("LOOP", "control"),
    ("RETURN", "control"),
    ("CALL", "control"),
    ("CONNECT", "network"),
    ("DISCONNECT", "network"),
    ("ROUTE", "network"),
    ("FILTER", "network"),
    ("AUTHENTICATE", "security"),
    ("AUTHORIZE", "security"),
    ("ENCRYPT", "security"),
    ("DECRYPT", "security"),
    ("ALLOCATE", "resource"),
    ("DEALLOCATE", "resource"),
    ("LOCK", "resource"),
    ("UNLOCK", "resource"),
    ("SAVE", "state"),
    ("RESTORE", "state"),
    ("CHECKPOINT", "state"),
    ("ROLLBACK", "state"),
    ("COORDINATE", "coordination"),
    ("SYNCHRONIZE", "coordination"),
    ("SIGNAL", "coordination"),
    ("WAIT", "coordination"),
];

/// Category of an operation primitive.
pub fn primitive_category(primitive: &str) -> Option<&'static str> {
    PRIMITIVES
        .iter()
        .find(|(name, _)| *name == primitive)
        .map(|(_, category)| *category)
}

fn answer(fields: Value) -> Result<Record, ComputeError> {
    match fields {
        Value::Object(map) => Ok(Record::new(ANSWER_SCHEMA, map)),
        _ => Err(ComputeError::Failed("answer fields must be an object".to_string())),
    }
}

/// Bounded local backend for Tier B.
#[derive(Debug, Clone)]
pub struct ShapeBackend {
    max_depth: usize,
}

impl ShapeBackend {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for ShapeBackend {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl ComputeBackend for ShapeBackend {
    fn name(&self) -> &str {
        "shape"
    }

    async fn compute(&self, request: &ExecutionRequest) -> Result<Computation, ComputeError> {
        let query = &request.query;
        let depth = query.depth();
        if depth > self.max_depth {
            return Err(ComputeError::Unsupported(format!(
                "depth {depth} exceeds {}",
                self.max_depth
            )));
        }

        let category = query
            .field("operation")
            .and_then(Value::as_str)
            .and_then(primitive_category);

        let fields = json!({
            "kind": query.schema(),
            "category": category.unwrap_or("unknown"),
            "count": query.fan_out(),
            "depth": depth,
        });
        Ok(Computation {
            answer: answer(fields)?,
            confidence: if category.is_some() { 0.9 } else { 0.5 },
        })
    }
}

/// Full-tree backend for Tier C.
#[derive(Debug, Clone, Default)]
pub struct AnalysisBackend;

impl AnalysisBackend {
    pub fn new() -> Self {
        Self
    }

    fn collect<'a>(value: &'a Value, found: &mut BTreeMap<&'a str, usize>) {
        match value {
            Value::String(s) if primitive_category(s).is_some() => {
                *found.entry(s.as_str()).or_default() += 1;
            }
            Value::Array(items) => items.iter().for_each(|v| Self::collect(v, found)),
            Value::Object(map) => map.values().for_each(|v| Self::collect(v, found)),
            _ => {}
        }
    }
}

#[async_trait]
impl ComputeBackend for AnalysisBackend {
    fn name(&self) -> &str {
        "analysis"
    }

    async fn compute(&self, request: &ExecutionRequest) -> Result<Computation, ComputeError> {
        let query = &request.query;
        let mut found = BTreeMap::new();
        for value in query.fields().values() {
            Self::collect(value, &mut found);
        }

        let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
        for (primitive, count) in &found {
            if let Some(category) = primitive_category(primitive) {
                *per_category.entry(category).or_default() += count;
            }
        }
        // Highest count wins; ties go to the alphabetically first category.
        let dominant = per_category
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(category, _)| *category)
            .unwrap_or("unknown");

        let mut fields = Map::new();
        fields.insert("kind".into(), json!(query.schema()));
        fields.insert("category".into(), json!(dominant));
        fields.insert("count".into(), json!(found.values().sum::<usize>()));
        fields.insert("items".into(), json!(found.keys().collect::<Vec<_>>()));
        fields.insert("total".into(), json!(query.fan_out()));
        fields.insert("depth".into(), json!(query.depth()));
        fields.insert("size".into(), json!(query.byte_size()));

        Ok(Computation {
            answer: Record::new(ANSWER_SCHEMA, fields),
            confidence: 0.95,
        })
    }
}
