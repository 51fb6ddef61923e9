//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! tasks and return deterministic outputs suitable for tests.

pub mod agent_output;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod retry;
pub mod rollup;
pub mod split;
pub mod types;
