//! Deterministic batch selection over a workflow.
//!
//! Selection works on the active phase only: the first phase (declaration
//! order) that still has an unfinished task. Within it, resumable work
//! (in-progress or retryable-failed) is taken ahead of fresh pending tasks.

use std::collections::HashSet;

use serde::Serialize;

use crate::core::types::{PhaseExecution, Task, TaskStatus, Workflow};

/// Batch selection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub batch_size: usize,
    pub phase_execution: PhaseExecution,
}

impl SelectionPolicy {
    fn cap(&self) -> usize {
        match self.phase_execution {
            PhaseExecution::Sequential => 1,
            PhaseExecution::Parallel => self.batch_size.max(1),
        }
    }
}

/// Why a not-done task in the active phase could not be selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub reason: String,
}

fn dependencies_done(workflow: &Workflow, task: &Task) -> bool {
    task.depends_on.iter().all(|dep| match workflow.task(dep) {
        Some(dep_task) => dep_task.status.is_done(),
        // Unknown ids never block; `validate` reports them.
        None => true,
    })
}

fn is_resumable(task: &Task) -> bool {
    task.status == TaskStatus::InProgress || task.is_retryable()
}

fn is_pending(task: &Task) -> bool {
    task.status == TaskStatus::Pending
}

/// The phase selection works on, or `None` when every task is done.
pub fn active_phase(workflow: &Workflow) -> Option<&str> {
    workflow.phases().into_iter().find(|phase| {
        workflow
            .tasks
            .iter()
            .any(|task| task.phase_id == *phase && !task.status.is_done())
    })
}

/// Select the next batch of task ids to run.
///
/// Two passes over the active phase in declaration order: resumable tasks
/// first, then pending ones. A task is skipped when its dependencies are not
/// done or when it shares a file annotation with a task already in the batch.
pub fn select_batch(workflow: &Workflow, policy: SelectionPolicy) -> Vec<String> {
    let Some(phase) = active_phase(workflow) else {
        return Vec::new();
    };
    let cap = policy.cap();
    let candidates: Vec<&Task> = workflow
        .tasks
        .iter()
        .filter(|task| task.phase_id == phase)
        .filter(|task| dependencies_done(workflow, task))
        .collect();

    let mut batch: Vec<String> = Vec::new();
    let mut claimed_files: HashSet<&str> = HashSet::new();
    let passes: [fn(&Task) -> bool; 2] = [is_resumable, is_pending];
    for pass in passes {
        for task in candidates.iter().filter(|task| pass(task)) {
            if batch.len() >= cap {
                return batch;
            }
            if task.files.iter().any(|file| claimed_files.contains(file.as_str())) {
                continue;
            }
            claimed_files.extend(task.files.iter().map(String::as_str));
            batch.push(task.id.clone());
        }
    }
    batch
}

/// Unfinished tasks in the active phase that cannot run, with the reason.
///
/// Empty when the workflow is complete. Used to explain an empty selection.
pub fn blocked_tasks(workflow: &Workflow) -> Vec<BlockedTask> {
    let Some(phase) = active_phase(workflow) else {
        return Vec::new();
    };
    workflow
        .tasks
        .iter()
        .filter(|task| task.phase_id == phase && !task.status.is_done())
        .filter_map(|task| {
            let reason = if task.is_exhausted() {
                format!(
                    "exhausted after {} retries: {}",
                    task.retry_count,
                    task.last_error.as_deref().unwrap_or("no error recorded")
                )
            } else if !dependencies_done(workflow, task) {
                let waiting: Vec<&str> = task
                    .depends_on
                    .iter()
                    .filter(|dep| workflow.task(dep).is_some_and(|d| !d.status.is_done()))
                    .map(String::as_str)
                    .collect();
                format!("waiting on {}", waiting.join(", "))
            } else {
                return None;
            };
            Some(BlockedTask {
                task_id: task.id.clone(),
                reason,
            })
        })
        .collect()
}
