//! Uniform interface to Tier B and Tier C computation.

use async_trait::async_trait;
use thiserror::Error;

use crate::router::ExecutionRequest;
use crate::staging::Record;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request not supported: {0}")]
    Unsupported(String),

    #[error("Computation failed: {0}")]
    Failed(String),
}

/// A computed answer and the backend's confidence in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Computation {
    pub answer: Record,
    /// In [0, 1].
    pub confidence: f64,
}

/// A tier's computation method.
///
/// Implementations must be cancel-safe: the router drops the future on
/// timeout or when the caller goes away.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn compute(&self, request: &ExecutionRequest) -> Result<Computation, ComputeError>;
}
