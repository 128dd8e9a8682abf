//! Autonomous execution engine for multi-phase workflows.
//!
//! A workflow is a set of tasks grouped into phases, tracked in a
//! crash-safe status file. An orchestration loop repeatedly selects a batch
//! of runnable tasks, hands it to an agent process, and records the outcome
//! until the workflow completes, blocks, is cancelled, or hits its cap.
//!
//! - **[`core`]**: Pure, deterministic logic (transitions, selection, marker
//!   parsing, conflict grading). No I/O.
//! - **[`io`]**: Side-effecting operations (status files, locks, git, agent
//!   processes, registry, control socket).
//!
//! Orchestration modules ([`step`], [`looping`], [`instance`], [`conflicts`],
//! [`commands`]) coordinate core logic with I/O to implement CLI commands.

pub mod commands;
pub mod conflicts;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod instance;
pub mod io;
pub mod logging;
pub mod looping;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
