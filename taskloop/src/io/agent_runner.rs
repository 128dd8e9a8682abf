//! Agent invocation.
//!
//! [`AgentRunner`] decouples the orchestration loop from the agent backend.
//! The command backend streams stdout into the run log and parses result
//! markers as lines arrive; tests use scripted runners that return canned
//! events without spawning anything.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::markers::{AgentEvent, AgentExit, parse_line};
use crate::io::config::AgentConfig;
use crate::io::process::{StreamOptions, run_streaming};

/// Environment variables exported to the agent process.
pub const ENV_WORKFLOW: &str = "TASKLOOP_WORKFLOW";
pub const ENV_RUN_ID: &str = "TASKLOOP_RUN_ID";
pub const ENV_TASK_IDS: &str = "TASKLOOP_TASK_IDS";

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workflow: String,
    pub run_id: String,
    pub task_ids: Vec<String>,
    pub prompt: String,
    /// Working directory for the agent process (the workspace root).
    pub workdir: PathBuf,
    /// Where agent stdout is streamed.
    pub log_path: PathBuf,
    pub timeout: Duration,
}

/// What the agent reported and how it ended.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub events: Vec<AgentEvent>,
    pub exit: AgentExit,
    pub duration: Duration,
}

pub trait AgentRunner {
    /// Run the agent for one batch. An `Err` means the agent could not be run
    /// at all; a failing or timed-out agent is reported through [`AgentRun::exit`].
    fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Runs the configured agent command with the prompt on stdin.
pub struct CommandAgentRunner {
    config: AgentConfig,
    output_limit_bytes: usize,
}

impl CommandAgentRunner {
    pub fn new(config: AgentConfig, output_limit_bytes: usize) -> Self {
        Self {
            config,
            output_limit_bytes,
        }
    }

    fn command(&self, request: &AgentRequest) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .envs(&self.config.env)
            .env(ENV_WORKFLOW, &request.workflow)
            .env(ENV_RUN_ID, &request.run_id)
            .env(ENV_TASK_IDS, request.task_ids.join(","));
        Ok(cmd)
    }
}

impl AgentRunner for CommandAgentRunner {
    #[instrument(skip_all, fields(run_id = %request.run_id, tasks = request.task_ids.len()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        let cmd = self.command(request)?;
        info!(workdir = %request.workdir.display(), "starting agent");

        let events: Arc<Mutex<Vec<AgentEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let on_line = Box::new(move |line: &str| {
            if let Some(event) = parse_line(line) {
                debug!(task_id = event.task_id(), "agent reported task");
                match sink.lock() {
                    Ok(mut guard) => guard.push(event),
                    Err(poisoned) => poisoned.into_inner().push(event),
                }
            }
        });

        let output = run_streaming(
            cmd,
            StreamOptions {
                stdin: Some(request.prompt.clone().into_bytes()),
                timeout: request.timeout,
                output_limit_bytes: self.output_limit_bytes,
                tee_path: Some(&request.log_path),
                on_line: Some(on_line),
            },
        )
        .context("run agent command")?;

        if !output.stderr.is_empty()
            && let Err(e) = append_stderr(&request.log_path, &output.stderr_lossy())
        {
            warn!(err = %format!("{e:#}"), "failed to append agent stderr to run log");
        }

        let exit = if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            AgentExit::TimedOut {
                timeout_secs: request.timeout.as_secs(),
            }
        } else {
            if !output.status.success() {
                warn!(exit_code = ?output.status.code(), "agent exited with failure");
            }
            AgentExit::Exited(output.status.code())
        };

        let events = match Arc::try_unwrap(events) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(shared) => match shared.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
        };
        debug!(events = events.len(), "agent finished");
        Ok(AgentRun {
            events,
            exit,
            duration: output.duration,
        })
    }
}

fn append_stderr(path: &std::path::Path, stderr: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    write!(file, "\n=== stderr ===\n{}", stderr)
        .with_context(|| format!("append stderr to {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn request(dir: &std::path::Path, timeout: Duration) -> AgentRequest {
        AgentRequest {
            workflow: "demo".to_string(),
            run_id: "run-0001".to_string(),
            task_ids: vec!["1.1".to_string(), "1.2".to_string()],
            prompt: "do the work\n".to_string(),
            workdir: dir.to_path_buf(),
            log_path: dir.join("runs").join("run-0001").join("agent.log"),
            timeout,
        }
    }

    fn shell_runner(script: &str) -> CommandAgentRunner {
        CommandAgentRunner::new(
            AgentConfig {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                env: Default::default(),
            },
            10_000,
        )
    }

    #[test]
    fn collects_markers_and_streams_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = shell_runner(
            "cat >/dev/null; echo working; echo \"TASK_COMPLETE: 1.1\"; \
             echo \"TASK_FAILED: $TASKLOOP_TASK_IDS\" | sed 's/1.1,//'; echo oops >&2",
        );
        let req = request(temp.path(), Duration::from_secs(10));

        let run = runner.run(&req).expect("run");

        assert_eq!(run.exit, AgentExit::Exited(Some(0)));
        assert_eq!(run.events.len(), 2);
        assert_eq!(run.events[0].task_id(), "1.1");
        assert_eq!(run.events[1].task_id(), "1.2");
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("working"));
        assert!(log.contains("=== stderr ===\noops"));
    }

    #[test]
    fn unwritable_run_log_keeps_reported_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = shell_runner(
            "cat >/dev/null; echo \"TASK_COMPLETE: 1.1\"; \
             rm -r runs/run-0001 && : > runs/run-0001; echo oops >&2",
        );
        let req = request(temp.path(), Duration::from_secs(10));

        let run = runner.run(&req).expect("run");

        assert_eq!(run.exit, AgentExit::Exited(Some(0)));
        assert_eq!(run.events.len(), 1);
        assert_eq!(run.events[0].task_id(), "1.1");
        assert!(temp.path().join("runs").join("run-0001").is_file());
    }

    #[test]
    fn timeout_is_reported_as_exit_not_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = shell_runner("echo \"TASK_COMPLETE: 1.1\"; exec sleep 5");
        let req = request(temp.path(), Duration::from_millis(300));

        let run = runner.run(&req).expect("run");

        assert_eq!(run.exit, AgentExit::TimedOut { timeout_secs: 0 });
        assert_eq!(run.events.len(), 1);
    }

    #[test]
    fn empty_command_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandAgentRunner::new(
            AgentConfig {
                command: Vec::new(),
                env: Default::default(),
            },
            1_000,
        );

        let err = runner
            .run(&request(temp.path(), Duration::from_secs(1)))
            .unwrap_err();
        assert!(err.to_string().contains("agent.command is empty"));
    }
}
