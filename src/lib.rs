//! CIL backend core: token authentication and background job queues.
//!
//! The binary in `main.rs` wires these together; integration tests in
//! `tests/` drive them directly.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod store;
