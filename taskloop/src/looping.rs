//! The orchestration loop: iterate until done, blocked, cancelled, or capped.
//!
//! Control commands are served only between iterations. An agent invocation
//! in flight always runs to completion or timeout before a pause or cancel
//! takes effect.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::selector::{BlockedTask, blocked_tasks};
use crate::core::types::{OrchestratorMode, Summary};
use crate::errors::is_lock_timeout;
use crate::io::agent_runner::AgentRunner;
use crate::io::control::{ControlRequest, ControlResponse, ControlServer};
use crate::io::status_store::StatusStore;
use crate::step::{Iteration, IterationOutcome, StepConfig, run_iteration};

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub mode: OrchestratorMode,
    /// Iterations (agent invocations and lock-contended attempts) before stopping.
    pub max_iterations: u32,
    pub step: StepConfig,
    /// Sleep between polls while paused or idle in continuous mode.
    pub poll_interval: Duration,
}

/// Why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Every task is completed or skipped.
    Complete,
    /// Nothing selectable, but unfinished tasks remain.
    Blocked { tasks: Vec<BlockedTask> },
    Cancelled,
    /// Incomplete run; not an error.
    MaxIterationsReached { max_iterations: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub workflow: String,
    pub stop: StopReason,
    pub iterations: u32,
    pub summary: Summary,
}

/// Flags set over the control channel.
#[derive(Debug, Default)]
struct LoopState {
    paused: bool,
    cancelled: bool,
    iterations: u32,
}

/// Drive `workflow` until it completes, blocks, is cancelled, or hits the cap.
///
/// Lock timeouts are retried after `poll_interval`; every other error aborts
/// the loop.
#[instrument(skip_all, fields(workflow, mode = options.mode.as_str()))]
pub fn run_loop<R, F>(
    store: &StatusStore,
    runner: &R,
    workflow: &str,
    options: &LoopOptions,
    control: Option<&ControlServer>,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    R: AgentRunner,
    F: FnMut(&IterationOutcome),
{
    let mut state = LoopState::default();
    let stop = loop {
        if let Some(server) = control {
            match server.poll(|request| handle_control(store, workflow, &mut state, request)) {
                Ok(0) => {}
                Ok(n) => debug!(handled = n, "control requests served"),
                Err(e) => warn!(err = %e, "control channel poll failed"),
            }
        }
        if state.cancelled {
            info!("cancelled over control channel");
            break StopReason::Cancelled;
        }
        if state.paused {
            thread::sleep(options.poll_interval);
            continue;
        }
        if state.iterations >= options.max_iterations {
            break StopReason::MaxIterationsReached {
                max_iterations: options.max_iterations,
            };
        }

        match run_iteration(store, runner, &options.step, workflow) {
            Ok(Iteration::Ran(outcome)) => {
                state.iterations += 1;
                on_iteration(&outcome);
            }
            Ok(Iteration::Idle { .. }) => {
                if options.mode == OrchestratorMode::Continuous {
                    thread::sleep(options.poll_interval);
                    continue;
                }
                let current = store.load(workflow)?;
                if current.summary.is_complete() {
                    break StopReason::Complete;
                }
                break StopReason::Blocked {
                    tasks: blocked_tasks(&current),
                };
            }
            Err(err) if is_lock_timeout(&err) => {
                state.iterations += 1;
                warn!(err = %err, "status lock busy; retrying next iteration");
                thread::sleep(options.poll_interval);
            }
            Err(err) => return Err(err),
        }
    };

    let summary = store.load(workflow)?.summary;
    info!(stop = ?stop, iterations = state.iterations, "loop finished");
    Ok(LoopOutcome {
        workflow: workflow.to_string(),
        stop,
        iterations: state.iterations,
        summary,
    })
}

fn handle_control(
    store: &StatusStore,
    workflow: &str,
    state: &mut LoopState,
    request: ControlRequest,
) -> ControlResponse {
    match request {
        ControlRequest::Pause => {
            state.paused = true;
            ControlResponse::with_data(json!({ "paused": true }))
        }
        ControlRequest::Resume => {
            state.paused = false;
            ControlResponse::with_data(json!({ "paused": false }))
        }
        ControlRequest::Cancel => {
            state.cancelled = true;
            ControlResponse::with_data(json!({ "cancelled": true }))
        }
        ControlRequest::SkipTask { task_id, reason } => {
            let reason = reason.unwrap_or_else(|| "skipped over control channel".to_string());
            match store.mark_skipped(workflow, &task_id, &reason) {
                Ok(_) => ControlResponse::with_data(json!({ "task_id": task_id, "status": "skipped" })),
                Err(e) => ControlResponse::error(format!("{e:#}")),
            }
        }
        ControlRequest::RetryTask { task_id } => match store.reset_task(workflow, &task_id) {
            Ok(_) => ControlResponse::with_data(json!({ "task_id": task_id, "status": "pending" })),
            Err(e) => ControlResponse::error(format!("{e:#}")),
        },
        ControlRequest::Status => match store.load(workflow) {
            Ok(current) => ControlResponse::with_data(json!({
                "workflow": workflow,
                "paused": state.paused,
                "cancelled": state.cancelled,
                "iterations": state.iterations,
                "current_phase": current.current_phase,
                "summary": current.summary,
            })),
            Err(e) => ControlResponse::error(format!("{e:#}")),
        },
    }
}
