//! Execution request and outcome types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::entry::Tier;
use crate::keys::{KeyContext, TrivariateKey};
use crate::staging::Record;

/// One query against the router.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub query: Record,
    pub context: KeyContext,
    pub identity: String,
}

impl ExecutionRequest {
    pub fn new(query: Record, context: KeyContext, identity: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            context,
            identity: identity.into(),
        }
    }
}

/// Router state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Classify,
    TryA,
    TryB,
    TryC,
    Done,
    Failed,
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RouterState::Classify => "classify",
            RouterState::TryA => "try_a",
            RouterState::TryB => "try_b",
            RouterState::TryC => "try_c",
            RouterState::Done => "done",
            RouterState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub request_id: Uuid,
    pub key: TrivariateKey,
    pub result: Record,
    pub tier: Tier,
    pub confidence: f64,
    pub score: f64,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// States visited, in order.
    pub states: Vec<RouterState>,
    /// Whether this request waited on another request's in-flight computation.
    pub shared: bool,
}

fn serialize_millis<S: serde::Serializer>(
    elapsed: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64() * 1000.0)
}
