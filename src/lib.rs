//! patchloom library crate
//!
//! The patch model, fuzzy applier, dependency graph, consistency checker,
//! reflection engine, step orchestrator and job queue. The binary is a thin
//! CLI over these; benchmarks and integration tests use them directly.

pub mod cache;
pub mod config;
pub mod consistency;
pub mod files;
pub mod generate;
pub mod graph;
pub mod orchestrator;
pub mod patch;
pub mod queue;
pub mod reflection;
pub mod symbols;
pub mod tracing_setup;
pub mod util;
