//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::types::Workflow;

/// Check semantic invariants a status file must satisfy to be trusted:
/// - No duplicate task ids
/// - Every task id is non-empty
/// - At most one open run
/// - Run ids are unique
///
/// Returns stable error messages (empty on success). Repairable drift
/// (summary, current phase, retry counts) is not reported here.
pub fn validate_invariants(workflow: &Workflow) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for task in &workflow.tasks {
        if task.id.trim().is_empty() {
            errors.push("task with empty id".to_string());
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
    }

    let open_runs = workflow.runs.iter().filter(|run| run.is_open()).count();
    if open_runs > 1 {
        errors.push(format!("{open_runs} open runs (at most one allowed)"));
    }

    let mut run_ids = HashSet::new();
    for run in &workflow.runs {
        if !run_ids.insert(run.run_id.as_str()) {
            errors.push(format!("duplicate run id '{}'", run.run_id));
        }
    }

    errors
}

/// Dependency references that do not name a task in the workflow.
///
/// Unknown dependencies never block selection; they are surfaced by `validate`.
pub fn unknown_dependencies(workflow: &Workflow) -> Vec<String> {
    let ids: HashSet<&str> = workflow.tasks.iter().map(|task| task.id.as_str()).collect();
    let mut problems = Vec::new();
    for task in &workflow.tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                problems.push(format!("task '{}' depends on unknown task '{}'", task.id, dep));
            }
        }
    }
    problems
}

/// Clamp `retry_count` to `max_retries`. Returns the ids that were clamped.
pub fn clamp_retry_counts(workflow: &mut Workflow, max_retries: u32) -> Vec<String> {
    let mut clamped = Vec::new();
    for task in &mut workflow.tasks {
        if task.retry_count > max_retries {
            task.retry_count = max_retries;
            clamped.push(task.id.clone());
        }
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Run, Task};
    use chrono::Utc;

    fn open_run(id: &str) -> Run {
        Run {
            run_id: id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            tasks_completed: 0,
            tasks_failed: 0,
            task_ids: Vec::new(),
            interrupted: false,
        }
    }

    #[test]
    fn rejects_duplicate_ids_and_multiple_open_runs() {
        let mut workflow = Workflow::new(
            "w",
            "plan.md",
            vec![Task::new("1.1", "1", "a"), Task::new("1.1", "1", "b")],
            Utc::now(),
        );
        workflow.runs = vec![open_run("run-0001"), open_run("run-0002")];

        let errors = validate_invariants(&workflow);
        assert_eq!(
            errors,
            vec![
                "duplicate task id '1.1'".to_string(),
                "2 open runs (at most one allowed)".to_string(),
            ]
        );
    }

    #[test]
    fn clamps_retry_counts_above_cap() {
        let mut workflow = Workflow::new("w", "plan.md", vec![Task::new("1.1", "1", "a")], Utc::now());
        workflow.tasks[0].retry_count = 9;
        assert_eq!(clamp_retry_counts(&mut workflow, 2), vec!["1.1".to_string()]);
        assert_eq!(workflow.tasks[0].retry_count, 2);
    }

    #[test]
    fn reports_unknown_dependencies() {
        let mut task = Task::new("1.2", "1", "b");
        task.depends_on = vec!["1.1".to_string(), "9.9".to_string()];
        let workflow = Workflow::new("w", "plan.md", vec![Task::new("1.1", "1", "a"), task], Utc::now());
        assert_eq!(
            unknown_dependencies(&workflow),
            vec!["task '1.2' depends on unknown task '9.9'".to_string()]
        );
    }
}
