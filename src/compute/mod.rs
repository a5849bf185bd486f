//! Tier B and Tier C computation.
//!
//! - [`backend`]: the `ComputeBackend` trait the router calls
//! - [`local`]: built-in in-process backends

pub mod backend;
pub mod local;

pub use backend::{ComputeBackend, ComputeError, Computation};
pub use local::{AnalysisBackend, ShapeBackend};
