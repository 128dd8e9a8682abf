//! Per-run artifacts under `.taskloop/workflows/<name>/runs/<run-id>/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::markers::TaskResult;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    /// Complete agent stdout, streamed as it arrives.
    pub agent_log: PathBuf,
    pub meta: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let dir = runs_dir.join(run_id);
        Self {
            agent_log: dir.join("agent.log"),
            meta: dir.join("meta.json"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create run dir {}", self.dir.display()))
    }
}

/// Summary of one agent invocation, written after outcomes are applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMeta {
    pub run_id: String,
    pub task_ids: Vec<String>,
    pub outcomes: BTreeMap<String, RunTaskOutcome>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unexpected_markers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunTaskOutcome {
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        findings: Option<String>,
    },
    Failed {
        message: String,
    },
}

impl From<&TaskResult> for RunTaskOutcome {
    fn from(result: &TaskResult) -> Self {
        match result {
            TaskResult::Completed { findings } => RunTaskOutcome::Completed {
                findings: findings.clone(),
            },
            TaskResult::Failed { message } => RunTaskOutcome::Failed {
                message: message.clone(),
            },
        }
    }
}

pub fn write_run_meta(paths: &RunPaths, meta: &RunMeta) -> Result<()> {
    write_json_atomic(&paths.meta, meta)
}

pub fn read_run_meta(paths: &RunPaths) -> Result<RunMeta> {
    let raw = fs::read_to_string(&paths.meta)
        .with_context(|| format!("read {}", paths.meta.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", paths.meta.display()))
}
