//! Tiered execution routing.
//!
//! - [`request`]: ExecutionRequest, ExecutionOutcome and router states
//! - [`classifier`]: complexity score and tier thresholds
//! - [`engine`]: the A/B/C state machine with single-flight
//! - [`retry`]: bounded exponential backoff for Tier C

pub mod classifier;
pub mod engine;
pub mod request;
pub mod retry;

pub use classifier::{Classification, ComplexityClassifier, RequestFeatures};
pub use engine::{Router, RouterError};
pub use request::{ExecutionOutcome, ExecutionRequest, RouterState};
