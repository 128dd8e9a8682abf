//! CLI operations over one workspace, each returning a JSON-ready result.
//!
//! Every function takes an explicit workflow name; resolving the
//! active-workflow pointer is left to the binary.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::conflicts::ConflictDetector;
use crate::core::types::{OrchestratorMode, Task};
use crate::instance::InstanceGuard;
use crate::io::agent_runner::{AgentRunner, CommandAgentRunner};
use crate::io::config::{Config, load_config};
use crate::io::control::{ControlRequest, ControlServer, send_control};
use crate::io::registry::Registry;
use crate::io::status_store::{StatusStore, state_dir};
use crate::looping::{LoopOptions, LoopOutcome, run_loop};
use crate::step::StepConfig;

/// Overrides for `taskloop run`.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub mode: OrchestratorMode,
    pub max_iterations: Option<u32>,
    pub batch_size: Option<usize>,
}

/// A workspace root with its configuration loaded.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config: Config,
    store: StatusStore,
}

pub fn config_path(root: &Path) -> PathBuf {
    state_dir(root).join("config.toml")
}

impl Workspace {
    /// Load `.taskloop/config.toml` under `root` (defaults when absent).
    pub fn open(root: &Path) -> Result<Self> {
        let config = load_config(&config_path(root))?;
        Ok(Self::with_config(root, config))
    }

    pub fn with_config(root: &Path, config: Config) -> Self {
        Self {
            store: StatusStore::new(root, &config),
            root: root.to_path_buf(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    fn registry(&self) -> Result<Registry> {
        Ok(Registry::new(
            self.config.resolve_registry_dir()?,
            self.config.lock_options(),
        ))
    }

    pub fn init(&self, workflow: &str, source: &Path, force: bool) -> Result<Value> {
        let created = self.store.init(workflow, source, force)?;
        Ok(json!({
            "workflow": created.workflow_name,
            "source_path": created.source_path,
            "phases": created.phases(),
            "summary": created.summary,
        }))
    }

    pub fn list(&self) -> Result<Value> {
        Ok(json!({ "workflows": self.store.list_workflows()? }))
    }

    pub fn status(&self, workflow: &str) -> Result<Value> {
        let loaded = self.store.load_with_origin(workflow)?;
        let wf = &loaded.workflow;
        Ok(json!({
            "workflow": wf.workflow_name,
            "source_path": wf.source_path,
            "origin": loaded.origin,
            "current_phase": wf.current_phase,
            "summary": wf.summary,
            "completion_percent": wf.summary.completion_percent(),
            "current_run": wf.current_run(),
            "runs": wf.runs.len(),
            "tasks": wf.tasks,
        }))
    }

    pub fn next(&self, workflow: &str, n: usize) -> Result<Value> {
        let tasks = self
            .store
            .next(workflow, n, self.config.phase_execution)?;
        Ok(json!({ "tasks": tasks }))
    }

    pub fn mark_started(&self, workflow: &str, id: &str) -> Result<Value> {
        let wf = self.store.mark_started(workflow, id)?;
        task_result(&wf.tasks, id)
    }

    pub fn mark_complete(&self, workflow: &str, id: &str, notes: Option<String>) -> Result<Value> {
        let wf = self.store.mark_completed(workflow, id, notes, None)?;
        task_result(&wf.tasks, id)
    }

    pub fn mark_failed(&self, workflow: &str, id: &str, error: &str) -> Result<Value> {
        let wf = self.store.mark_failed(workflow, id, error)?;
        task_result(&wf.tasks, id)
    }

    pub fn mark_skipped(&self, workflow: &str, id: &str, reason: &str) -> Result<Value> {
        let wf = self.store.mark_skipped(workflow, id, reason)?;
        task_result(&wf.tasks, id)
    }

    pub fn increment_retry(&self, workflow: &str, id: &str, error: &str) -> Result<Value> {
        let outcome = self.store.increment_retry(workflow, id, error)?;
        Ok(serde_json::to_value(outcome)?)
    }

    pub fn reset_task(&self, workflow: &str, id: &str) -> Result<Value> {
        let wf = self.store.reset_task(workflow, id)?;
        task_result(&wf.tasks, id)
    }

    /// Repair derived fields and report what was wrong.
    pub fn validate(&self, workflow: &str) -> Result<Value> {
        Ok(serde_json::to_value(self.store.repair(workflow)?)?)
    }

    pub fn detect_stuck(&self, workflow: &str, threshold_ms: Option<u64>) -> Result<Value> {
        let threshold_ms = threshold_ms.unwrap_or(self.config.stuck_task_threshold_ms);
        let stuck = self.store.detect_stuck(workflow, threshold_ms)?;
        Ok(json!({ "threshold_ms": threshold_ms, "stuck": stuck }))
    }

    pub fn retryable(&self, workflow: &str) -> Result<Value> {
        Ok(json!({ "tasks": self.store.retryable(workflow)? }))
    }

    pub fn exhausted(&self, workflow: &str) -> Result<Value> {
        Ok(json!({ "tasks": self.store.exhausted(workflow)? }))
    }

    /// Open a run for `task_ids`, or for the next selectable batch when empty.
    pub fn start_run(&self, workflow: &str, task_ids: &[String]) -> Result<Value> {
        let task_ids: Vec<String> = if task_ids.is_empty() {
            self.store
                .next(workflow, self.config.batch_size, self.config.phase_execution)?
                .into_iter()
                .map(|task| task.id)
                .collect()
        } else {
            task_ids.to_vec()
        };
        if task_ids.is_empty() {
            bail!("no selectable tasks in workflow '{workflow}'");
        }
        let run_id = self.store.start_run(workflow, &task_ids)?;
        Ok(json!({ "run_id": run_id, "task_ids": task_ids }))
    }

    pub fn complete_run(
        &self,
        workflow: &str,
        run_id: &str,
        completed: u32,
        failed: u32,
    ) -> Result<Value> {
        let wf = self.store.complete_run(workflow, run_id, completed, failed)?;
        let run = wf.runs.iter().find(|run| run.run_id == run_id);
        Ok(json!({ "run": run, "summary": wf.summary }))
    }

    /// Run the orchestration loop with the configured agent command.
    pub fn run(&self, workflow: &str, options: RunOptions) -> Result<LoopOutcome> {
        let runner = CommandAgentRunner::new(
            self.config.agent.clone(),
            self.config.output_limit_bytes,
        );
        self.run_with(workflow, options, &runner)
    }

    /// Register, open the control socket, and loop until a stop condition.
    pub fn run_with<R: AgentRunner>(
        &self,
        workflow: &str,
        options: RunOptions,
        runner: &R,
    ) -> Result<LoopOutcome> {
        self.store.load(workflow)?;
        let paths = self.store.paths(workflow);
        // Register before binding: binding replaces any socket file in the way.
        let _guard = InstanceGuard::acquire(
            self.registry()?,
            workflow,
            options.mode,
            &self.root,
            &paths.control_socket,
        )?;
        let control = match ControlServer::bind(&paths.control_socket) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(err = %format!("{e:#}"), "control channel unavailable; running without it");
                None
            }
        };

        let mut step = StepConfig::from_config(&self.config);
        if let Some(batch_size) = options.batch_size {
            step.policy.batch_size = batch_size;
        }
        let loop_options = LoopOptions {
            mode: options.mode,
            max_iterations: options.max_iterations.unwrap_or(self.config.max_iterations),
            step,
            poll_interval: self.config.poll_interval(),
        };
        run_loop(
            &self.store,
            runner,
            workflow,
            &loop_options,
            control.as_ref(),
            |iteration| {
                info!(
                    run_id = %iteration.run_id,
                    completed = iteration.completed.len(),
                    failed = iteration.failed.len(),
                    "iteration recorded"
                );
            },
        )
    }

    pub fn instances(&self) -> Result<Value> {
        Ok(json!({ "instances": self.registry()?.list()? }))
    }

    /// Send `request` to the orchestrator running `workflow`.
    pub fn control(&self, workflow: &str, request: &ControlRequest) -> Result<Value> {
        let record = self
            .registry()?
            .get(workflow)?
            .ok_or_else(|| anyhow!("no running orchestrator for workflow '{workflow}'"))?;
        let response = send_control(&record.control_socket, request)?;
        if !response.ok {
            return Err(anyhow!(
                "orchestrator rejected request: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        Ok(response.data.unwrap_or_else(|| json!({})))
    }

    fn detector(&self, base: Option<&str>) -> ConflictDetector {
        ConflictDetector::new(&self.root, base.unwrap_or(&self.config.base_branch))
    }

    pub fn conflicts(&self, branches: &[String], base: Option<&str>) -> Result<Value> {
        Ok(serde_json::to_value(self.detector(base).report(branches)?)?)
    }

    pub fn merge_order(&self, branches: &[String], base: Option<&str>) -> Result<Value> {
        let report = self.detector(base).report(branches)?;
        Ok(json!({
            "base": report.base,
            "order": report.recommended_merge_order,
            "scores": report.merge_scores,
        }))
    }

    pub fn preview_merge(&self, a: &str, b: &str) -> Result<Value> {
        Ok(serde_json::to_value(self.detector(None).preview_merge(a, b)?)?)
    }
}

fn task_result(tasks: &[Task], id: &str) -> Result<Value> {
    let task = tasks
        .iter()
        .find(|task| task.id == id)
        .ok_or_else(|| anyhow!("task '{id}' missing after update"))?;
    Ok(json!({ "task": task }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::looping::StopReason;
    use crate::test_support::{ScriptedAgentRunner, ScriptedRun, complete, fast_config};
    use std::fs;

    fn workspace(temp: &Path) -> Workspace {
        fs::write(
            temp.join("plan.md"),
            "## Phase 1: Build\n- [ ] 1.1 First\n- [ ] 1.2 Second\n",
        )
        .expect("plan");
        let mut config = fast_config();
        config.registry_dir = Some(temp.join("registry"));
        let ws = Workspace::with_config(temp, config);
        ws.init("demo", Path::new("plan.md"), false).expect("init");
        ws
    }

    #[test]
    fn status_and_manual_transitions_return_structured_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = workspace(temp.path());

        let started = ws.mark_started("demo", "1.1").expect("start");
        assert_eq!(started["task"]["status"], "in_progress");
        let done = ws
            .mark_complete("demo", "1.1", Some("done".to_string()))
            .expect("complete");
        assert_eq!(done["task"]["notes"], "done");

        let status = ws.status("demo").expect("status");
        assert_eq!(status["summary"]["completed"], 1);
        assert_eq!(status["summary"]["pending"], 1);
        assert_eq!(status["completion_percent"], 50.0);

        let next = ws.next("demo", 5).expect("next");
        assert_eq!(next["tasks"][0]["id"], "1.2");
    }

    #[test]
    fn run_registers_loops_and_unregisters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = workspace(temp.path());
        let runner = ScriptedAgentRunner::new(vec![ScriptedRun::exited(
            0,
            vec![complete("1.1"), complete("1.2")],
        )]);

        let outcome = ws
            .run_with(
                "demo",
                RunOptions {
                    mode: OrchestratorMode::Batch,
                    max_iterations: None,
                    batch_size: None,
                },
                &runner,
            )
            .expect("run");

        assert_eq!(outcome.stop, StopReason::Complete);
        let instances = ws.instances().expect("instances");
        assert_eq!(instances["instances"].as_array().expect("array").len(), 0);
        assert!(!ws.store().paths("demo").control_socket.exists());
    }

    #[test]
    fn control_without_running_orchestrator_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = workspace(temp.path());
        let err = ws.control("demo", &ControlRequest::Status).unwrap_err();
        assert!(err.to_string().contains("no running orchestrator"));
    }
}
