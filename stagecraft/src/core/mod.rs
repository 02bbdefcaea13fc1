//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! descriptors and return deterministic outputs suitable for tests.

pub mod health;
pub mod identity;
pub mod launch;
pub mod manifest;
pub mod metadata;
pub mod paths;
pub mod stage_graph;
pub mod types;
