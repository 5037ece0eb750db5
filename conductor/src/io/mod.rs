//! Side-effecting adapters: filesystem state, git, subprocesses, providers.

pub mod atomic;
pub mod branch_map;
pub mod config;
pub mod git;
pub mod init;
pub mod op_log;
pub mod policy_store;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod task_store;
pub mod tools;
