//! Task delegation backend.
//!
//! An operator hands software-engineering tasks to an AI agent; this crate
//! keeps the resulting change set safe, reviewable and reversible:
//!
//! - **[`core`]**: pure logic (policy gate, limits, task ordering, tool-call
//!   normalization, safety assessment). No I/O.
//! - **[`io`]**: side-effecting adapters (state files, git, subprocesses,
//!   providers, tool execution).
//! - **[`orchestrator`]**: per-task branch lifecycle and merges.
//! - **[`execution`]**: the provider/tool loop for one task.
//! - **[`autorun`]**: the autonomous multi-task runner.

pub mod autorun;
pub mod cancel;
pub mod core;
pub mod error;
pub mod execution;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
