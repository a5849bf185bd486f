//! HTTP server.
//!
//! - [`api`]: request/response types, route handlers and error mapping

pub mod api;
