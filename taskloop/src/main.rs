//! Autonomous workflow execution engine.
//!
//! Tracks multi-phase workflows in `.taskloop/workflows/<name>/status.json`
//! and drives an agent through them batch by batch. Every command prints one
//! JSON object on stdout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value, json};

use taskloop::commands::{RunOptions, Workspace};
use taskloop::core::types::OrchestratorMode;
use taskloop::exit_codes;
use taskloop::io::atomic::write_atomic;
use taskloop::io::control::ControlRequest;
use taskloop::io::status_store::{state_dir, validate_workflow_name};
use taskloop::logging;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Autonomous execution engine for multi-phase workflows"
)]
struct Cli {
    /// Workspace root holding `.taskloop/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Workflow to operate on (default: the one selected with `use`).
    #[arg(long, global = true)]
    workflow: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a workflow from a task-definition document.
    Init {
        name: String,
        #[arg(long)]
        source: PathBuf,
        /// Overwrite an existing workflow.
        #[arg(short, long)]
        force: bool,
    },
    /// Make `name` the default workflow for later commands.
    Use { name: String },
    /// List workflows in this workspace.
    List,
    /// Summary, current phase, current run, and every task.
    Status,
    /// The next `n` selectable tasks, without changing state.
    Next {
        #[arg(default_value_t = 1)]
        n: usize,
    },
    MarkStarted { id: String },
    MarkComplete {
        id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    MarkFailed {
        id: String,
        #[arg(long)]
        error: String,
    },
    MarkSkipped {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Validate and repair the status file.
    Validate,
    /// Fail in-progress tasks older than the threshold.
    DetectStuck {
        #[arg(long)]
        threshold_ms: Option<u64>,
    },
    /// Failed tasks with retries left.
    Retryable,
    /// Failed tasks out of retries.
    Exhausted,
    /// Record a failure against the task's retry budget.
    IncrementRetry {
        id: String,
        #[arg(long)]
        error: String,
    },
    /// Move a failed task back to pending.
    ResetTask { id: String },
    /// Open a run for the given tasks (default: the next batch).
    StartRun {
        #[arg(long, value_delimiter = ',')]
        tasks: Vec<String>,
    },
    CompleteRun {
        run_id: String,
        #[arg(long)]
        completed: u32,
        #[arg(long)]
        failed: u32,
    },
    /// Run the orchestration loop.
    Run {
        #[arg(long, value_enum, default_value_t = Mode::Batch)]
        mode: Mode,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Registered orchestrators and their liveness.
    Instances,
    /// Send a command to the orchestrator running `name`.
    Control {
        name: String,
        #[command(subcommand)]
        action: ControlAction,
    },
    /// Pairwise overlap report for branches against a base.
    Conflicts {
        #[arg(required = true)]
        branches: Vec<String>,
        #[arg(long)]
        base: Option<String>,
    },
    /// Suggested merge order, least conflicting and most complete first.
    MergeOrder {
        #[arg(required = true)]
        branches: Vec<String>,
        #[arg(long)]
        base: Option<String>,
    },
    /// Simulate merging `b` into `a` without touching refs or the worktree.
    PreviewMerge { a: String, b: String },
}

#[derive(Subcommand)]
enum ControlAction {
    Pause,
    Resume,
    Cancel,
    Skip {
        task_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Retry {
        task_id: String,
    },
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Batch,
    Continuous,
}

impl From<Mode> for OrchestratorMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Batch => OrchestratorMode::Batch,
            Mode::Continuous => OrchestratorMode::Continuous,
        }
    }
}

impl From<ControlAction> for ControlRequest {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Pause => ControlRequest::Pause,
            ControlAction::Resume => ControlRequest::Resume,
            ControlAction::Cancel => ControlRequest::Cancel,
            ControlAction::Skip { task_id, reason } => ControlRequest::SkipTask { task_id, reason },
            ControlAction::Retry { task_id } => ControlRequest::RetryTask { task_id },
            ControlAction::Status => ControlRequest::Status,
        }
    }
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            println!("{}", json!({ "success": false, "error": err.to_string().trim_end() }));
            std::process::exit(exit_codes::ERROR);
        }
    };
    let code = match run(cli) {
        Ok(data) => {
            println!("{}", success(data));
            exit_codes::OK
        }
        Err(err) => {
            println!("{}", json!({ "success": false, "error": format!("{err:#}") }));
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

/// `{"success": true}` merged with an object result, or wrapped as `result`.
fn success(data: Value) -> Value {
    let mut out = Map::new();
    out.insert("success".to_string(), Value::Bool(true));
    match data {
        Value::Object(fields) => out.extend(fields),
        Value::Null => {}
        other => {
            out.insert("result".to_string(), other);
        }
    }
    Value::Object(out)
}

fn run(cli: Cli) -> Result<Value> {
    let ws = Workspace::open(&cli.root)?;
    let explicit = cli.workflow;
    let workflow = || resolve_workflow(&cli.root, explicit.as_deref());
    match cli.command {
        Command::Init {
            name,
            source,
            force,
        } => {
            let created = ws.init(&name, &source, force)?;
            if read_active(&cli.root)?.is_none() {
                write_active(&cli.root, &name)?;
            }
            Ok(created)
        }
        Command::Use { name } => {
            ws.store().load(&name)?;
            write_active(&cli.root, &name)?;
            Ok(json!({ "workflow": name }))
        }
        Command::List => ws.list(),
        Command::Status => ws.status(&workflow()?),
        Command::Next { n } => ws.next(&workflow()?, n),
        Command::MarkStarted { id } => ws.mark_started(&workflow()?, &id),
        Command::MarkComplete { id, notes } => ws.mark_complete(&workflow()?, &id, notes),
        Command::MarkFailed { id, error } => ws.mark_failed(&workflow()?, &id, &error),
        Command::MarkSkipped { id, reason } => ws.mark_skipped(&workflow()?, &id, &reason),
        Command::Validate => ws.validate(&workflow()?),
        Command::DetectStuck { threshold_ms } => ws.detect_stuck(&workflow()?, threshold_ms),
        Command::Retryable => ws.retryable(&workflow()?),
        Command::Exhausted => ws.exhausted(&workflow()?),
        Command::IncrementRetry { id, error } => ws.increment_retry(&workflow()?, &id, &error),
        Command::ResetTask { id } => ws.reset_task(&workflow()?, &id),
        Command::StartRun { tasks } => ws.start_run(&workflow()?, &tasks),
        Command::CompleteRun {
            run_id,
            completed,
            failed,
        } => ws.complete_run(&workflow()?, &run_id, completed, failed),
        Command::Run {
            mode,
            max_iterations,
            batch_size,
        } => {
            let outcome = ws.run(
                &workflow()?,
                RunOptions {
                    mode: mode.into(),
                    max_iterations,
                    batch_size,
                },
            )?;
            Ok(serde_json::to_value(outcome)?)
        }
        Command::Instances => ws.instances(),
        Command::Control { name, action } => ws.control(&name, &action.into()),
        Command::Conflicts { branches, base } => ws.conflicts(&branches, base.as_deref()),
        Command::MergeOrder { branches, base } => ws.merge_order(&branches, base.as_deref()),
        Command::PreviewMerge { a, b } => ws.preview_merge(&a, &b),
    }
}

fn active_path(root: &Path) -> PathBuf {
    state_dir(root).join("active")
}

fn read_active(root: &Path) -> Result<Option<String>> {
    let path = active_path(root);
    match fs::read_to_string(&path) {
        Ok(raw) => Ok(Some(raw.trim().to_string()).filter(|name| !name.is_empty())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn write_active(root: &Path, name: &str) -> Result<()> {
    validate_workflow_name(name)?;
    let path = active_path(root);
    fs::create_dir_all(state_dir(root))
        .with_context(|| format!("create {}", state_dir(root).display()))?;
    write_atomic(&path, format!("{name}\n").as_bytes())
}

fn resolve_workflow(root: &Path, explicit: Option<&str>) -> Result<String> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    match read_active(root)? {
        Some(name) => Ok(name),
        None => bail!("no workflow selected: pass --workflow or run `taskloop use <name>`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "taskloop",
            "run",
            "--mode",
            "continuous",
            "--max-iterations",
            "3",
        ]);
        assert!(matches!(
            cli.command,
            Command::Run {
                mode: Mode::Continuous,
                max_iterations: Some(3),
                batch_size: None,
            }
        ));
    }

    #[test]
    fn parse_start_run_task_list() {
        let cli = Cli::parse_from(["taskloop", "--workflow", "w", "start-run", "--tasks", "1.1,1.2"]);
        let Command::StartRun { tasks } = cli.command else {
            panic!("expected start-run");
        };
        assert_eq!(tasks, vec!["1.1", "1.2"]);
        assert_eq!(cli.workflow.as_deref(), Some("w"));
    }

    #[test]
    fn parse_control_skip() {
        let cli = Cli::parse_from(["taskloop", "control", "auth", "skip", "2.1", "--reason", "manual"]);
        let Command::Control { name, action } = cli.command else {
            panic!("expected control");
        };
        assert_eq!(name, "auth");
        assert_eq!(
            ControlRequest::from(action),
            ControlRequest::SkipTask {
                task_id: "2.1".to_string(),
                reason: Some("manual".to_string()),
            }
        );
    }

    #[test]
    fn success_merges_object_fields() {
        let out = success(json!({ "tasks": [] }));
        assert_eq!(out, json!({ "success": true, "tasks": [] }));
        assert_eq!(success(json!(3)), json!({ "success": true, "result": 3 }));
    }

    #[test]
    fn active_pointer_round_trips_and_explicit_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(resolve_workflow(temp.path(), None).is_err());
        write_active(temp.path(), "auth").expect("write");
        assert_eq!(resolve_workflow(temp.path(), None).expect("active"), "auth");
        assert_eq!(
            resolve_workflow(temp.path(), Some("other")).expect("explicit"),
            "other"
        );
    }
}
