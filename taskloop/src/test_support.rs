//! Test-only helpers: scripted agent runs, workflow fixtures, scratch git repos.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::markers::{AgentEvent, AgentExit};
use crate::io::agent_runner::{AgentRequest, AgentRun, AgentRunner};
use crate::io::config::Config;
use crate::io::status_store::StatusStore;

/// Completion marker event for `id`.
pub fn complete(id: &str) -> AgentEvent {
    AgentEvent::Completed {
        task_id: id.to_string(),
        findings: None,
    }
}

/// Failure marker event for `id`.
pub fn fail(id: &str, message: &str) -> AgentEvent {
    AgentEvent::Failed {
        task_id: id.to_string(),
        message: message.to_string(),
    }
}

/// One canned agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    result: std::result::Result<(Vec<AgentEvent>, AgentExit), String>,
}

impl ScriptedRun {
    pub fn exited(code: i32, events: Vec<AgentEvent>) -> Self {
        Self {
            result: Ok((events, AgentExit::Exited(Some(code)))),
        }
    }

    pub fn timed_out(timeout_secs: u64, events: Vec<AgentEvent>) -> Self {
        Self {
            result: Ok((events, AgentExit::TimedOut { timeout_secs })),
        }
    }

    /// The runner itself fails (for example, the agent binary is missing).
    pub fn error(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

type Hook = Box<dyn FnMut(&AgentRequest) + Send>;

/// Agent runner that replays scripted runs in order and records requests.
pub struct ScriptedAgentRunner {
    script: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<AgentRequest>>,
    before_each: Mutex<Option<Hook>>,
}

impl ScriptedAgentRunner {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
            before_each: Mutex::new(None),
        }
    }

    /// Call `hook` with each request before its scripted result is returned.
    pub fn before_each(self, hook: impl FnMut(&AgentRequest) + Send + 'static) -> Self {
        *self.before_each.lock().expect("hook lock") = Some(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn assert_drained(&self) {
        let left = self.script.lock().expect("script lock").len();
        assert_eq!(left, 0, "{left} scripted agent run(s) were never used");
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        if let Some(hook) = self
            .before_each
            .lock()
            .map_err(|_| anyhow!("hook lock poisoned"))?
            .as_mut()
        {
            hook(request);
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted agent run left for {}", request.run_id))?;
        let (events, exit) = next.result.map_err(|msg| anyhow!(msg))?;

        let mut log = String::new();
        for event in &events {
            match event {
                AgentEvent::Completed { task_id, .. } => {
                    log.push_str(&format!("TASK_COMPLETE: {task_id}\n"));
                }
                AgentEvent::Failed { task_id, message } => {
                    log.push_str(&format!("TASK_FAILED: {task_id}: {message}\n"));
                }
            }
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, log)
            .with_context(|| format!("write {}", request.log_path.display()))?;

        Ok(AgentRun {
            events,
            exit,
            duration: Duration::from_millis(1),
        })
    }
}

/// A scratch workspace holding one initialized workflow.
pub struct WorkflowFixture {
    _temp: TempDir,
    pub root: PathBuf,
    pub config: Config,
    pub store: StatusStore,
}

impl WorkflowFixture {
    /// Workflow `name` with the given task ids, all in phase 1.
    pub fn new(name: &str, ids: &[&str]) -> Result<Self> {
        let mut plan = String::from("# Plan\n\n## Phase 1: Fixture\n");
        for id in ids {
            plan.push_str(&format!("- [ ] {id} Task {id}\n"));
        }
        Self::with_plan(name, &plan, fast_config())
    }

    /// Workflow `name` initialized from the markdown `plan`.
    pub fn with_plan(name: &str, plan: &str, config: Config) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        fs::write(root.join("plan.md"), plan)?;
        let store = StatusStore::new(&root, &config);
        store.init(name, Path::new("plan.md"), false)?;
        Ok(Self {
            _temp: temp,
            root,
            config,
            store,
        })
    }
}

/// Defaults with short timeouts so contention tests finish quickly.
pub fn fast_config() -> Config {
    Config {
        lock_timeout_ms: 2_000,
        poll_interval_ms: 10,
        per_iteration_timeout_secs: 5,
        ..Config::default()
    }
}

/// A throwaway git repository with a deterministic identity.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let repo = Self { _temp: temp, root };
        repo.git(&["init", "--quiet", "--initial-branch=main"])?;
        repo.git(&["config", "user.email", "tests@example.com"])?;
        repo.git(&["config", "user.name", "Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        Ok(())
    }

    pub fn checkout_new(&self, branch: &str, from: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", "-b", branch, from])?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", branch])?;
        Ok(())
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Numbered lines `line 1` .. `line n`, newline-terminated.
pub fn numbered_lines(n: usize) -> String {
    (1..=n).map(|i| format!("line {i}\n")).collect()
}
