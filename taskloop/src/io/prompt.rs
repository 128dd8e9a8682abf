//! Agent prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Task, Workflow};

const AGENT_TEMPLATE: &str = include_str!("prompts/agent.md");

/// Per-task template context.
#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    description: &'a str,
    depends_on: &'a [String],
    files: &'a [String],
    last_error: Option<&'a str>,
    retry_count: u32,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            description: task.description.trim(),
            depends_on: &task.depends_on,
            files: &task.files,
            last_error: task.last_error.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            retry_count: task.retry_count,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("agent", AGENT_TEMPLATE)
            .context("load agent prompt template")?;
        Ok(Self { env })
    }

    /// Render the prompt for one batch. Unknown ids are skipped.
    pub fn render_agent(&self, workflow: &Workflow, run_id: &str, task_ids: &[String]) -> Result<String> {
        let tasks: Vec<TaskContext<'_>> = task_ids
            .iter()
            .filter_map(|id| workflow.task(id))
            .map(TaskContext::from_task)
            .collect();
        let phase = tasks
            .first()
            .and_then(|task| workflow.task(task.id))
            .map(|task| task.phase_id.as_str());
        let template = self.env.get_template("agent")?;
        let rendered = template
            .render(context! {
                workflow => &workflow.workflow_name,
                run_id => run_id,
                source_path => workflow.source_path.display().to_string(),
                phase => phase,
                tasks => tasks,
            })
            .context("render agent prompt")?;
        Ok(rendered)
    }
}
