//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod branch_name;
pub mod conflict;
pub mod limits;
pub mod policy;
pub mod safety;
pub mod selector;
pub mod tool_call;
pub mod types;
