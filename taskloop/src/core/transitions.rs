//! Task and run transitions applied to an in-memory workflow.
//!
//! Every function here is a pure mutation of `Workflow`; the status store wraps
//! them in its lock/backup/atomic-write path. Derived fields (`summary`,
//! `current_phase`) are recomputed by the caller after mutation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{Run, Task, TaskStatus, Workflow};
use crate::errors::{InvalidTransitionError, RunNotFoundError, TaskNotFoundError};

/// Result of recording a failure against a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub task_id: String,
    pub retry_count: u32,
    /// No retries left; the task will not be selected again automatically.
    pub exhausted: bool,
}

fn task_mut<'a>(workflow: &'a mut Workflow, id: &str) -> Result<&'a mut Task> {
    let name = workflow.workflow_name.clone();
    workflow.task_mut(id).ok_or_else(|| {
        TaskNotFoundError {
            workflow: name,
            task_id: id.to_string(),
        }
        .into()
    })
}

fn invalid(task: &Task, to: TaskStatus) -> anyhow::Error {
    InvalidTransitionError {
        task_id: task.id.clone(),
        from: task.status,
        to,
    }
    .into()
}

/// pending | in_progress | failed (retryable) -> in_progress.
pub fn mark_started(workflow: &mut Workflow, id: &str, now: DateTime<Utc>) -> Result<()> {
    let task = task_mut(workflow, id)?;
    let allowed = match task.status {
        TaskStatus::Pending | TaskStatus::InProgress => true,
        TaskStatus::Failed => !task.exhausted,
        TaskStatus::Completed | TaskStatus::Skipped => false,
    };
    if !allowed {
        return Err(invalid(task, TaskStatus::InProgress));
    }
    task.status = TaskStatus::InProgress;
    task.started_at = Some(now);
    task.completed_at = None;
    Ok(())
}

/// in_progress -> completed. Completing a completed task is a no-op.
pub fn mark_completed(
    workflow: &mut Workflow,
    id: &str,
    notes: Option<String>,
    findings_ref: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let task = task_mut(workflow, id)?;
    match task.status {
        TaskStatus::Completed => return Ok(()),
        TaskStatus::InProgress => {}
        _ => return Err(invalid(task, TaskStatus::Completed)),
    }
    task.status = TaskStatus::Completed;
    task.completed_at = Some(now);
    task.last_error = None;
    task.stuck = false;
    if notes.is_some() {
        task.notes = notes;
    }
    if findings_ref.is_some() {
        task.findings_ref = findings_ref;
    }
    Ok(())
}

/// in_progress | failed -> failed, without consuming a retry.
pub fn mark_failed(workflow: &mut Workflow, id: &str, error: &str) -> Result<()> {
    let task = task_mut(workflow, id)?;
    if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Failed) {
        return Err(invalid(task, TaskStatus::Failed));
    }
    task.status = TaskStatus::Failed;
    task.last_error = Some(error.to_string());
    Ok(())
}

/// Record a failed attempt: in_progress | failed -> failed.
///
/// Consumes one retry while `retry_count < max_retries`; once the cap is
/// reached the task is flagged exhausted instead, so `retry_count` never
/// exceeds `max_retries`.
pub fn increment_retry(
    workflow: &mut Workflow,
    id: &str,
    error: &str,
    max_retries: u32,
) -> Result<RetryOutcome> {
    let task = task_mut(workflow, id)?;
    if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Failed) {
        return Err(invalid(task, TaskStatus::Failed));
    }
    task.status = TaskStatus::Failed;
    task.last_error = Some(error.to_string());
    if task.retry_count < max_retries {
        task.retry_count += 1;
    } else {
        task.exhausted = true;
    }
    Ok(RetryOutcome {
        task_id: task.id.clone(),
        retry_count: task.retry_count,
        exhausted: task.exhausted,
    })
}

/// pending | in_progress | failed -> skipped. Skipping a skipped task is a no-op.
pub fn mark_skipped(workflow: &mut Workflow, id: &str, reason: &str) -> Result<()> {
    let task = task_mut(workflow, id)?;
    match task.status {
        TaskStatus::Skipped => return Ok(()),
        TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Failed => {}
        TaskStatus::Completed => return Err(invalid(task, TaskStatus::Skipped)),
    }
    task.status = TaskStatus::Skipped;
    task.skip_reason = Some(reason.to_string());
    Ok(())
}

/// Manual retry: failed -> pending, clearing the exhausted and stuck flags.
///
/// `retry_count` is left as is so history stays visible; an exhausted task
/// that fails again is flagged exhausted again immediately.
pub fn reset_task(workflow: &mut Workflow, id: &str) -> Result<()> {
    let task = task_mut(workflow, id)?;
    if task.status != TaskStatus::Failed {
        return Err(invalid(task, TaskStatus::Pending));
    }
    task.status = TaskStatus::Pending;
    task.exhausted = false;
    task.stuck = false;
    task.started_at = None;
    Ok(())
}

/// In-progress tasks whose `started_at` is strictly older than `now - threshold_ms`.
///
/// A task in progress without a start time is treated as stuck.
pub fn find_stuck(workflow: &Workflow, now: DateTime<Utc>, threshold_ms: u64) -> Vec<String> {
    let threshold = chrono::Duration::milliseconds(i64::try_from(threshold_ms).unwrap_or(i64::MAX));
    workflow
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::InProgress)
        .filter(|task| match task.started_at {
            Some(started) => now.signed_duration_since(started) > threshold,
            None => true,
        })
        .map(|task| task.id.clone())
        .collect()
}

/// Fail every stuck task through retry accounting and flag it stuck.
pub fn fail_stuck(
    workflow: &mut Workflow,
    now: DateTime<Utc>,
    threshold_ms: u64,
    max_retries: u32,
) -> Result<Vec<RetryOutcome>> {
    let stuck = find_stuck(workflow, now, threshold_ms);
    let mut outcomes = Vec::with_capacity(stuck.len());
    for id in stuck {
        let since = workflow
            .task(&id)
            .and_then(|task| task.started_at)
            .map(|started| started.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        let message = format!("stuck: in progress since {since} (threshold {threshold_ms}ms)");
        let outcome = increment_retry(workflow, &id, &message, max_retries)?;
        task_mut(workflow, &id)?.stuck = true;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Open a new run for `task_ids` and return its id.
///
/// An open run left behind by a crashed orchestrator is closed first and
/// flagged `interrupted`, so at most one run is ever open.
pub fn start_run(workflow: &mut Workflow, task_ids: &[String], now: DateTime<Utc>) -> String {
    for run in workflow.runs.iter_mut().filter(|run| run.is_open()) {
        run.completed_at = Some(now);
        run.interrupted = true;
    }
    let run_id = format!("run-{:04}", workflow.runs.len() + 1);
    workflow.runs.push(Run {
        run_id: run_id.clone(),
        started_at: now,
        completed_at: None,
        tasks_completed: 0,
        tasks_failed: 0,
        task_ids: task_ids.to_vec(),
        interrupted: false,
    });
    run_id
}

/// Close the open run `run_id` with its final counts.
pub fn complete_run(
    workflow: &mut Workflow,
    run_id: &str,
    completed: u32,
    failed: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    let run = workflow
        .runs
        .iter_mut()
        .find(|run| run.run_id == run_id && run.is_open())
        .ok_or_else(|| RunNotFoundError {
            run_id: run_id.to_string(),
        })?;
    run.completed_at = Some(now);
    run.tasks_completed = completed;
    run.tasks_failed = failed;
    Ok(())
}

/// Failed tasks with retries left, in declaration order.
pub fn retryable(workflow: &Workflow) -> Vec<&Task> {
    workflow.tasks.iter().filter(|task| task.is_retryable()).collect()
}

/// Failed tasks with no retries left, in declaration order.
pub fn exhausted(workflow: &Workflow) -> Vec<&Task> {
    workflow.tasks.iter().filter(|task| task.is_exhausted()).collect()
}
