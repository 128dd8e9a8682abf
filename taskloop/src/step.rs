//! One iteration of the orchestration loop.
//!
//! Reclaims stuck tasks, selects a batch, opens a run, invokes the agent,
//! and records every task's result plus the closed run in a single locked
//! update.

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::markers::{AgentExit, TaskResult, resolve_results};
use crate::core::selector::{SelectionPolicy, select_batch};
use crate::core::transitions::{self, RetryOutcome};
use crate::core::types::Workflow;
use crate::errors::is_lock_timeout;
use crate::io::agent_runner::{AgentRequest, AgentRunner};
use crate::io::config::Config;
use crate::io::prompt::PromptEngine;
use crate::io::run_log::{RunMeta, RunPaths, RunTaskOutcome, write_run_meta};
use crate::io::status_store::StatusStore;

/// Ceiling for the pause between attempts at recording results.
const MAX_APPLY_BACKOFF: Duration = Duration::from_secs(2);

/// Knobs for a single iteration, usually derived from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub policy: SelectionPolicy,
    pub stuck_threshold_ms: u64,
    pub agent_timeout: Duration,
    /// Pause between attempts when the status lock is contended.
    pub lock_retry_interval: Duration,
}

impl StepConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.selection_policy(),
            stuck_threshold_ms: config.stuck_task_threshold_ms,
            agent_timeout: config.iteration_timeout(),
            lock_retry_interval: config.poll_interval(),
        }
    }
}

/// A task that failed in this iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub task_id: String,
    pub message: String,
    pub retry_count: u32,
    pub exhausted: bool,
}

/// What one agent invocation achieved.
#[derive(Debug, Clone, Serialize)]
pub struct IterationOutcome {
    pub run_id: String,
    pub task_ids: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<FailedTask>,
    /// Stuck tasks reclaimed before selection.
    pub stuck: Vec<RetryOutcome>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub enum Iteration {
    /// Nothing was selectable; no run was opened.
    Idle { stuck: Vec<RetryOutcome> },
    Ran(IterationOutcome),
}

/// Run one iteration for `workflow`.
///
/// Only infrastructure failures (lock contention before the agent starts,
/// unreadable state, an unwritable run directory) return `Err`. Agent crashes
/// and timeouts are recorded as task failures. Once the agent has run, lock
/// contention never discards its results: recording is retried until the
/// lock is won.
#[instrument(skip_all, fields(workflow))]
pub fn run_iteration<R: AgentRunner>(
    store: &StatusStore,
    runner: &R,
    config: &StepConfig,
    workflow: &str,
) -> Result<Iteration> {
    let started = Instant::now();
    let stuck = store.detect_stuck(workflow, config.stuck_threshold_ms)?;

    let current = store.load(workflow)?;
    if select_batch(&current, config.policy).is_empty() {
        debug!("nothing selectable");
        return Ok(Iteration::Idle { stuck });
    }

    let (snapshot, selected) = store.update_with(workflow, |wf| {
        let batch = select_batch(wf, config.policy);
        if batch.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        let run_id = transitions::start_run(wf, &batch, now);
        for id in &batch {
            transitions::mark_started(wf, id, now)?;
        }
        Ok(Some((run_id, batch)))
    })?;
    let Some((run_id, task_ids)) = selected else {
        return Ok(Iteration::Idle { stuck });
    };
    info!(run_id = %run_id, tasks = ?task_ids, "iteration started");

    let run_paths = RunPaths::new(&store.paths(workflow).runs_dir, &run_id);
    run_paths.create()?;
    let started_at = Utc::now();

    let prompt = PromptEngine::new()?.render_agent(&snapshot, &run_id, &task_ids)?;
    let request = AgentRequest {
        workflow: workflow.to_string(),
        run_id: run_id.clone(),
        task_ids: task_ids.clone(),
        prompt,
        workdir: store.root().to_path_buf(),
        log_path: run_paths.agent_log.clone(),
        timeout: config.agent_timeout,
    };

    let (results, unexpected, exit, runner_error) = match runner.run(&request) {
        Ok(run) => {
            let (results, unexpected) = resolve_results(&task_ids, &run.events, run.exit);
            (results, unexpected, Some(run.exit), None)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent runner failed");
            let message = format!("agent runner failed: {err:#}");
            let results: BTreeMap<String, TaskResult> = task_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        TaskResult::Failed {
                            message: message.clone(),
                        },
                    )
                })
                .collect();
            (results, Vec::new(), None, Some(message))
        }
    };
    for id in &unexpected {
        warn!(task_id = %id, "agent reported a task outside the batch; ignored");
    }

    let default_findings = relative_display(store.root(), &run_paths.agent_log);
    let max_retries = store.max_retries();
    let (_, (completed, failed)) = with_lock_retries(config.lock_retry_interval, || {
        store.update_with(workflow, |wf| {
            Ok(apply_results(wf, &run_id, &results, &default_findings, max_retries))
        })
    })?;

    let timed_out = matches!(exit, Some(AgentExit::TimedOut { .. }));
    let duration_ms = started.elapsed().as_millis() as u64;

    let meta = RunMeta {
        run_id: run_id.clone(),
        task_ids: task_ids.clone(),
        outcomes: results
            .iter()
            .map(|(id, result)| (id.clone(), RunTaskOutcome::from(result)))
            .collect(),
        exit_code: match exit {
            Some(AgentExit::Exited(code)) => code,
            _ => None,
        },
        timed_out,
        duration_ms,
        started_at,
        ended_at: Utc::now(),
        unexpected_markers: unexpected,
        runner_error,
    };
    write_run_meta(&run_paths, &meta)?;

    info!(
        run_id = %run_id,
        completed = completed.len(),
        failed = failed.len(),
        "iteration finished"
    );
    Ok(Iteration::Ran(IterationOutcome {
        run_id,
        task_ids,
        completed,
        failed,
        stuck,
        timed_out,
        duration_ms,
    }))
}

/// Record every result and close the run. Returns the completed ids and the
/// failures actually recorded.
///
/// Never fails part-way: a task whose state moved underneath the agent
/// (skipped over the control channel, say) keeps that state.
fn apply_results(
    workflow: &mut Workflow,
    run_id: &str,
    results: &BTreeMap<String, TaskResult>,
    default_findings: &str,
    max_retries: u32,
) -> (Vec<String>, Vec<FailedTask>) {
    let now = Utc::now();
    let mut completed = Vec::new();
    let mut failed = Vec::new();
    for (id, result) in results {
        let applied = match result {
            TaskResult::Completed { findings } => {
                let findings = findings.clone().or_else(|| Some(default_findings.to_string()));
                transitions::mark_completed(workflow, id, None, findings, now)
                    .map(|()| completed.push(id.clone()))
            }
            TaskResult::Failed { message } => {
                transitions::increment_retry(workflow, id, message, max_retries).map(|outcome| {
                    failed.push(FailedTask {
                        task_id: id.clone(),
                        message: message.clone(),
                        retry_count: outcome.retry_count,
                        exhausted: outcome.exhausted,
                    });
                })
            }
        };
        if let Err(err) = applied {
            warn!(task_id = %id, err = %err, "result not applied; task changed during the run");
        }
    }
    if let Err(err) = transitions::complete_run(
        workflow,
        run_id,
        completed.len() as u32,
        failed.len() as u32,
        now,
    ) {
        warn!(run_id, err = %err, "run was already closed");
    }
    (completed, failed)
}

/// Retry `attempt` while it fails on lock contention, backing off up to
/// [`MAX_APPLY_BACKOFF`]. Any other error is returned.
fn with_lock_retries<T>(interval: Duration, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    let mut tries: u32 = 1;
    let mut backoff = interval;
    loop {
        match attempt() {
            Err(err) if is_lock_timeout(&err) => {
                warn!(
                    tries,
                    backoff_ms = backoff.as_millis() as u64,
                    "status lock busy while recording results; retrying"
                );
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_APPLY_BACKOFF.max(interval));
                tries += 1;
            }
            other => return other,
        }
    }
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
