//! Shared deterministic types for the workflow state model.
//!
//! These types are the on-disk contract of `status.json`. Field names are
//! snake_case and must stay stable across releases; new fields are added with
//! `#[serde(default)]` so older files keep loading.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// Completed or skipped: nothing more will happen to the task.
    pub fn is_done(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Dotted hierarchical id, unique within the workflow (e.g. `2.3`).
    pub id: String,
    pub phase_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries consumed so far. Never exceeds the configured `max_retries`.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Pointer to an output artifact (agent log or a path the agent reported).
    pub findings_ref: Option<String>,
    /// Set when a failure was recorded with no retries left.
    #[serde(default)]
    pub exhausted: bool,
    /// Set when the failure came from stuck detection rather than the agent.
    #[serde(default)]
    pub stuck: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Files the task is expected to touch. Tasks sharing a file never run in
    /// the same batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        phase_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            phase_id: phase_id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            findings_ref: None,
            exhausted: false,
            stuck: false,
            depends_on: Vec::new(),
            files: Vec::new(),
            notes: None,
            skip_reason: None,
        }
    }

    /// Failed with retries left.
    pub fn is_retryable(&self) -> bool {
        self.status == TaskStatus::Failed && !self.exhausted
    }

    /// Failed with no retries left; needs an operator.
    pub fn is_exhausted(&self) -> bool {
        self.status == TaskStatus::Failed && self.exhausted
    }
}

/// One supervised batch execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the run is active.
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    #[serde(default)]
    pub task_ids: Vec<String>,
    /// Closed by a later run because its orchestrator never finished it.
    #[serde(default)]
    pub interrupted: bool,
}

impl Run {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Task counts per status. Always derived from `tasks`, never edited by hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut summary = Summary {
            total: tasks.len(),
            ..Summary::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// Every task is completed or skipped (vacuously true for an empty plan).
    pub fn is_complete(&self) -> bool {
        self.completed + self.skipped == self.total
    }

    /// Share of done tasks in percent, 0.0 for an empty plan.
    pub fn completion_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed + self.skipped) as f64 * 100.0 / self.total as f64
    }
}

/// Persisted state of a named plan (`status.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_name: String,
    /// Read-only task-definition document the tasks were declared in.
    pub source_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_phase: Option<String>,
    /// Declaration order.
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub runs: Vec<Run>,
    /// Recomputed on every load; the stored value is only a hint.
    #[serde(default)]
    pub summary: Summary,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        tasks: Vec<Task>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut workflow = Self {
            workflow_name: name.into(),
            source_path: source_path.into(),
            created_at: now,
            last_updated_at: now,
            current_phase: None,
            tasks,
            runs: Vec::new(),
            summary: Summary::default(),
        };
        crate::core::summary::refresh_derived(&mut workflow);
        workflow
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// The run with `completed_at == None`, if any.
    pub fn current_run(&self) -> Option<&Run> {
        self.runs.iter().find(|run| run.is_open())
    }

    /// Phase ids in declaration order (first appearance wins).
    pub fn phases(&self) -> Vec<&str> {
        let mut phases: Vec<&str> = Vec::new();
        for task in &self.tasks {
            if !phases.contains(&task.phase_id.as_str()) {
                phases.push(task.phase_id.as_str());
            }
        }
        phases
    }
}

/// How the orchestrator treats an empty ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorMode {
    /// Stop when nothing is selectable.
    Batch,
    /// Keep polling for work (and control commands) until cancelled.
    Continuous,
}

impl OrchestratorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorMode::Batch => "batch",
            OrchestratorMode::Continuous => "continuous",
        }
    }
}

/// Default batching for tasks of the same phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseExecution {
    /// Up to `batch_size` tasks per iteration, minus file conflicts.
    Parallel,
    /// One task per iteration.
    Sequential,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_each_status() {
        let mut tasks = vec![
            Task::new("1.1", "1", "a"),
            Task::new("1.2", "1", "b"),
            Task::new("1.3", "1", "c"),
            Task::new("2.1", "2", "d"),
        ];
        tasks[0].status = TaskStatus::Completed;
        tasks[1].status = TaskStatus::Failed;
        tasks[2].status = TaskStatus::Skipped;

        let summary = Summary::from_tasks(&tasks);
        assert_eq!(
            summary,
            Summary {
                total: 4,
                pending: 1,
                in_progress: 0,
                completed: 1,
                failed: 1,
                skipped: 1,
            }
        );
        assert!(!summary.is_complete());
        assert_eq!(summary.completion_percent(), 50.0);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn phases_follow_declaration_order() {
        let workflow = Workflow::new(
            "w",
            "plan.md",
            vec![
                Task::new("2.1", "2", "x"),
                Task::new("1.1", "1", "y"),
                Task::new("2.2", "2", "z"),
            ],
            Utc::now(),
        );
        assert_eq!(workflow.phases(), vec!["2", "1"]);
    }
}
