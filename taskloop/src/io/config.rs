//! Orchestrator configuration stored under `.taskloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::selector::SelectionPolicy;
use crate::core::types::PhaseExecution;
use crate::io::atomic::write_atomic;
use crate::io::lock::LockOptions;

/// Environment variable overriding the default registry directory.
pub const HOME_ENV: &str = "TASKLOOP_HOME";

/// Orchestrator configuration (TOML).
///
/// Edited by humans, so every field has a default and unknown-but-missing
/// fields fall back to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Retries allowed per task before it is flagged exhausted.
    pub max_retries: u32,

    /// An in-progress task older than this is considered abandoned.
    pub stuck_task_threshold_ms: u64,

    pub lock_timeout_ms: u64,
    /// A lock holder past this age is logged as suspect. Dead holders
    /// release their locks immediately.
    pub stale_lock_ms: u64,

    /// Iteration cap for one `run` invocation.
    pub max_iterations: u32,

    pub batch_size: usize,

    /// Wall-clock budget for one agent invocation.
    pub per_iteration_timeout_secs: u64,

    /// Whether tasks of the same phase share a batch by default.
    pub phase_execution: PhaseExecution,

    /// Cadence for continuous-mode polling, pause polling and lock retries.
    pub poll_interval_ms: u64,

    /// Agent stdout/stderr kept in memory per invocation (the log file is complete).
    pub output_limit_bytes: usize,

    /// Default base ref for conflict analysis.
    pub base_branch: String,

    /// Where the instance registry lives. Defaults to `$TASKLOOP_HOME`, else `~/.taskloop`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<PathBuf>,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line; the rendered prompt is written to its stdin.
    pub command: Vec<String>,

    /// Extra environment for the agent process.
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 2,
            stuck_task_threshold_ms: 30 * 60 * 1000,
            lock_timeout_ms: 10_000,
            stale_lock_ms: 60_000,
            max_iterations: 50,
            batch_size: 5,
            per_iteration_timeout_secs: 600,
            phase_execution: PhaseExecution::Parallel,
            poll_interval_ms: 1_000,
            output_limit_bytes: 1_000_000,
            base_branch: "main".to_string(),
            registry_dir: None,
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let positive: [(&str, u64); 7] = [
            ("max_iterations", u64::from(self.max_iterations)),
            ("batch_size", self.batch_size as u64),
            ("per_iteration_timeout_secs", self.per_iteration_timeout_secs),
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("stale_lock_ms", self.stale_lock_ms),
            ("stuck_task_threshold_ms", self.stuck_task_threshold_ms),
            ("output_limit_bytes", self.output_limit_bytes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must not be empty"));
        }
        Ok(())
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::from_millis(self.lock_timeout_ms, self.stale_lock_ms)
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            batch_size: self.batch_size,
            phase_execution: self.phase_execution,
        }
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.per_iteration_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Registry directory: explicit setting, then `$TASKLOOP_HOME`, then `~/.taskloop`.
    pub fn resolve_registry_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.registry_dir {
            return Ok(dir.clone());
        }
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        dirs::home_dir()
            .map(|home| home.join(".taskloop"))
            .ok_or_else(|| anyhow!("cannot determine home directory; set {HOME_ENV}"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.phase_execution = PhaseExecution::Sequential;
        cfg.agent.env.insert("MODEL".to_string(), "fast".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "batch_size = 2\n[agent]\ncommand = [\"my-agent\"]\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.batch_size, 2);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.agent.command, vec!["my-agent".to_string()]);
        assert_eq!(cfg.phase_execution, PhaseExecution::Parallel);
    }

    #[test]
    fn rejects_zero_values_and_empty_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 0\n").expect("write");
        let err = load_config(&path).expect_err("zero iterations");
        assert!(format!("{err:#}").contains("max_iterations must be > 0"));

        let cfg = Config {
            agent: AgentConfig {
                command: Vec::new(),
                env: BTreeMap::new(),
            },
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_registry_dir_wins() {
        let cfg = Config {
            registry_dir: Some(PathBuf::from("/tmp/registry")),
            ..Config::default()
        };
        assert_eq!(
            cfg.resolve_registry_dir().expect("resolve"),
            PathBuf::from("/tmp/registry")
        );
    }
}
