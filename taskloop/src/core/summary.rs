//! Derived workflow fields: `summary` and `current_phase`.

use crate::core::types::{Summary, Workflow};

/// First phase (declaration order) that still has a task not completed/skipped.
pub fn derive_current_phase(workflow: &Workflow) -> Option<String> {
    workflow
        .phases()
        .into_iter()
        .find(|phase| {
            workflow
                .tasks
                .iter()
                .any(|task| task.phase_id == *phase && !task.status.is_done())
        })
        .map(str::to_string)
}

/// Recompute derived fields in place. Returns true if the stored values drifted.
pub fn refresh_derived(workflow: &mut Workflow) -> bool {
    let summary = Summary::from_tasks(&workflow.tasks);
    let current_phase = derive_current_phase(workflow);
    let drifted = summary != workflow.summary || current_phase != workflow.current_phase;
    workflow.summary = summary;
    workflow.current_phase = current_phase;
    drifted
}
