//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod conflict;
pub mod invariants;
pub mod markers;
pub mod selector;
pub mod summary;
pub mod transitions;
pub mod types;
