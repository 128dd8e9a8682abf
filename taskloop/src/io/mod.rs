//! Side effects: filesystem state, locks, child processes, git, sockets.

pub mod agent_runner;
pub mod atomic;
pub mod config;
pub mod control;
pub mod git;
pub mod lock;
pub mod plan_source;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod run_log;
pub mod status_store;
