//! Typed errors that callers branch on.
//!
//! Everything else travels as plain `anyhow::Error` with context. These types are
//! wrapped in `anyhow::Error` too, and recovered with `downcast_ref` where the
//! distinction matters (retry vs abort, exit code selection).

use std::path::PathBuf;

use crate::core::types::TaskStatus;

/// A lock file could not be acquired before the timeout. Transient: retry later.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {waited_ms}ms waiting for lock {}", path.display())]
pub struct LockTimeoutError {
    pub path: PathBuf,
    pub waited_ms: u64,
}

/// Another live process already orchestrates this workflow.
#[derive(Debug, thiserror::Error)]
#[error("workflow '{workflow}' is already being orchestrated by live process {pid}")]
pub struct DuplicateWorkflowError {
    pub workflow: String,
    pub pid: u32,
}

/// No status file, backup, or source document exists for the workflow.
#[derive(Debug, thiserror::Error)]
#[error("workflow '{workflow}' not found (run `taskloop init {workflow} --source <plan>`)")]
pub struct WorkflowNotFoundError {
    pub workflow: String,
}

#[derive(Debug, thiserror::Error)]
#[error("task '{task_id}' not found in workflow '{workflow}'")]
pub struct TaskNotFoundError {
    pub workflow: String,
    pub task_id: String,
}

/// A status change that the task state machine does not allow.
#[derive(Debug, thiserror::Error)]
#[error("task '{task_id}' cannot move from {from} to {to}")]
pub struct InvalidTransitionError {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, thiserror::Error)]
#[error("no open run '{run_id}'")]
pub struct RunNotFoundError {
    pub run_id: String,
}

/// True if `err` (or anything in its chain) is a lock timeout.
pub fn is_lock_timeout(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<LockTimeoutError>().is_some())
}

/// Find a `DuplicateWorkflowError` anywhere in the chain.
pub fn as_duplicate(err: &anyhow::Error) -> Option<&DuplicateWorkflowError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<DuplicateWorkflowError>())
}
