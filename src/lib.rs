//! cas-tier-router: hash-addressed staged store with a tiered execution router.
//!
//! Records are reduced through three lossless stages
//! (structured JSON → symbolic binary → dictionary-compact tokens), keyed by
//! a trivariate xxh3 key and stored in a content-addressable store. Execution
//! requests are routed through three tiers:
//!   A (cached answer) → B (bounded local computation) → C (full computation)
//! and recurring confident B/C results are promoted into Tier A.

pub mod cache;
pub mod compute;
pub mod config;
pub mod ingest;
pub mod keys;
pub mod metrics;
pub mod router;
pub mod server;
pub mod service;
pub mod staging;
