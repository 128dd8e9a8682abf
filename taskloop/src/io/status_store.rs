//! Crash-safe, lock-protected persistence of workflow state.
//!
//! Layout under `<root>/.taskloop/workflows/<name>/`:
//!
//! - `status.json`: primary state
//! - `status.json.bak`: state before the most recent update
//! - `status.json.tmp`: staging file for the next atomic replace (never read)
//! - `status.lock`: advisory lock serializing every writer
//! - `source`: path of the plan document, used for reconstruction
//!
//! Every mutation goes through [`StatusStore::stage`] + [`StagedUpdate::commit`]
//! (wrapped by [`StatusStore::update`]): lock, load, mutate, recompute derived
//! fields, back up the prior state, write the staging file, rename it over the
//! primary, unlock. A crash at any point leaves either the old or the new
//! complete state in `status.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use jsonschema::{Draft, Validator};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::invariants::{clamp_retry_counts, unknown_dependencies, validate_invariants};
use crate::core::selector::{SelectionPolicy, select_batch};
use crate::core::summary::refresh_derived;
use crate::core::transitions::{self, RetryOutcome};
use crate::core::types::{PhaseExecution, Task, Workflow};
use crate::errors::WorkflowNotFoundError;
use crate::io::atomic::{sync_dir, to_json_bytes, write_atomic, write_atomic_via, write_synced};
use crate::io::config::Config;
use crate::io::lock::{FileLock, LockOptions};
use crate::io::plan_source::read_plan;

const STATUS_SCHEMA: &str = include_str!("../../schemas/status.schema.json");

static STATUS_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(STATUS_SCHEMA).map_err(|e| format!("parse status schema: {e}"))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| format!("compile status schema: {e}"))
});

/// `<root>/.taskloop`
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(".taskloop")
}

pub fn workflows_dir(root: &Path) -> PathBuf {
    state_dir(root).join("workflows")
}

/// Paths owned by one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPaths {
    pub dir: PathBuf,
    pub status: PathBuf,
    pub backup: PathBuf,
    pub staging: PathBuf,
    pub lock: PathBuf,
    pub source: PathBuf,
    pub control_socket: PathBuf,
    pub runs_dir: PathBuf,
}

impl WorkflowPaths {
    pub fn new(root: &Path, name: &str) -> Self {
        let dir = workflows_dir(root).join(name);
        Self {
            status: dir.join("status.json"),
            backup: dir.join("status.json.bak"),
            staging: dir.join("status.json.tmp"),
            lock: dir.join("status.lock"),
            source: dir.join("source"),
            control_socket: dir.join("control.sock"),
            runs_dir: dir.join("runs"),
            dir,
        }
    }
}

/// Workflow names become directory names, so keep them path-safe.
pub fn validate_workflow_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        bail!("invalid workflow name '{name}' (use letters, digits, '-', '_', '.')");
    }
    Ok(())
}

/// Where a loaded workflow came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrigin {
    Primary,
    Backup,
    Reconstructed,
}

/// A workflow plus what loading had to repair.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub workflow: Workflow,
    pub origin: LoadOrigin,
    /// Stored summary or current phase disagreed with the tasks.
    pub summary_drift: bool,
    /// Task ids whose `retry_count` exceeded `max_retries`.
    pub clamped: Vec<String>,
}

impl Loaded {
    pub fn needs_repair(&self) -> bool {
        self.origin != LoadOrigin::Primary || self.summary_drift || !self.clamped.is_empty()
    }
}

/// Outcome of [`StatusStore::repair`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub origin: LoadOrigin,
    pub summary_drift: bool,
    pub clamped: Vec<String>,
    /// Problems that cannot be repaired automatically.
    pub warnings: Vec<String>,
    pub repaired: bool,
}

/// A mutation written to the staging file, with the lock still held.
///
/// Dropping it without [`commit`](StagedUpdate::commit) abandons the update:
/// the lock is released and `status.json` is untouched.
#[derive(Debug)]
pub struct StagedUpdate<T> {
    lock: FileLock,
    staging: PathBuf,
    status: PathBuf,
    workflow: Workflow,
    value: T,
}

impl<T> StagedUpdate<T> {
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Rename the staging file over the primary and release the lock.
    pub fn commit(self) -> Result<(Workflow, T)> {
        let parent = self
            .status
            .parent()
            .with_context(|| format!("status path missing parent {}", self.status.display()))?;
        fs::rename(&self.staging, &self.status)
            .with_context(|| format!("replace {}", self.status.display()))?;
        sync_dir(parent)?;
        self.lock.release()?;
        Ok((self.workflow, self.value))
    }
}

/// Read/update access to every workflow under one workspace root.
#[derive(Debug, Clone)]
pub struct StatusStore {
    root: PathBuf,
    max_retries: u32,
    lock_options: LockOptions,
}

impl StatusStore {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            root: root.into(),
            max_retries: config.max_retries,
            lock_options: config.lock_options(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn paths(&self, name: &str) -> WorkflowPaths {
        WorkflowPaths::new(&self.root, name)
    }

    fn resolve_source(&self, source: &Path) -> PathBuf {
        if source.is_absolute() {
            source.to_path_buf()
        } else {
            self.root.join(source)
        }
    }

    /// Create a workflow from a plan document.
    ///
    /// Refuses to replace an existing workflow unless `force` is set; a forced
    /// init keeps the previous state as the backup.
    #[instrument(skip_all, fields(workflow = name))]
    pub fn init(&self, name: &str, source: &Path, force: bool) -> Result<Workflow> {
        validate_workflow_name(name)?;
        let plan = read_plan(&self.resolve_source(source))?;
        let paths = self.paths(name);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create workflow dir {}", paths.dir.display()))?;

        let _lock = FileLock::acquire(&paths.lock, self.lock_options)?;
        if paths.status.exists() {
            if !force {
                bail!(
                    "workflow '{name}' already exists at {} (use --force to replace)",
                    paths.status.display()
                );
            }
            fs::copy(&paths.status, &paths.backup)
                .with_context(|| format!("back up {}", paths.status.display()))?;
        }

        let workflow = Workflow::new(name, source, plan.tasks, Utc::now());
        write_atomic(&paths.source, source.to_string_lossy().as_bytes())?;
        write_atomic_via(&paths.status, &paths.staging, &to_json_bytes(&workflow)?)?;
        info!(tasks = workflow.tasks.len(), "workflow initialized");
        Ok(workflow)
    }

    /// Workflow names with state on disk, sorted.
    pub fn list_workflows(&self) -> Result<Vec<String>> {
        let dir = workflows_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if path.join("status.json").exists() || path.join("source").exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load a workflow (primary, then backup, then reconstruction).
    pub fn load(&self, name: &str) -> Result<Workflow> {
        Ok(self.load_with_origin(name)?.workflow)
    }

    /// Load a workflow and report what had to be repaired. Never writes.
    #[instrument(skip_all, fields(workflow = name))]
    pub fn load_with_origin(&self, name: &str) -> Result<Loaded> {
        validate_workflow_name(name)?;
        let paths = self.paths(name);

        let (mut workflow, origin) = match read_status_file(&paths.status) {
            Ok(workflow) => (workflow, LoadOrigin::Primary),
            Err(primary_err) => {
                if paths.status.exists() {
                    warn!(err = %format!("{primary_err:#}"), "primary status file unusable");
                }
                match read_status_file(&paths.backup) {
                    Ok(workflow) => {
                        warn!(path = %paths.backup.display(), "restored workflow from backup");
                        (workflow, LoadOrigin::Backup)
                    }
                    Err(backup_err) => {
                        if paths.backup.exists() {
                            warn!(err = %format!("{backup_err:#}"), "backup status file unusable");
                        }
                        (self.reconstruct(name, &paths)?, LoadOrigin::Reconstructed)
                    }
                }
            }
        };

        let clamped = clamp_retry_counts(&mut workflow, self.max_retries);
        if !clamped.is_empty() {
            warn!(tasks = ?clamped, max_retries = self.max_retries, "clamped retry_count above cap");
        }
        let summary_drift = refresh_derived(&mut workflow);
        if summary_drift && origin != LoadOrigin::Reconstructed {
            warn!("stored summary/current_phase disagreed with tasks; recomputed");
        }
        debug!(?origin, tasks = workflow.tasks.len(), "workflow loaded");
        Ok(Loaded {
            workflow,
            origin,
            summary_drift,
            clamped,
        })
    }

    fn reconstruct(&self, name: &str, paths: &WorkflowPaths) -> Result<Workflow> {
        let not_found = || -> anyhow::Error {
            WorkflowNotFoundError {
                workflow: name.to_string(),
            }
            .into()
        };
        let pointer = match fs::read_to_string(&paths.source) {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
            _ => return Err(not_found()),
        };
        let source = self.resolve_source(&pointer);
        if !source.exists() {
            return Err(not_found());
        }
        let plan = read_plan(&source)?;
        warn!(source = %source.display(), "reconstructed workflow from plan document");
        Ok(Workflow::new(name, pointer, plan.tasks, Utc::now()))
    }

    /// Lock, load, apply `mutate`, and write the result to the staging file.
    ///
    /// If `mutate` fails nothing is written. The prior state is written to the
    /// backup before the staging file.
    #[instrument(skip_all, fields(workflow = name))]
    pub fn stage<T, F>(&self, name: &str, mutate: F) -> Result<StagedUpdate<T>>
    where
        F: FnOnce(&mut Workflow) -> Result<T>,
    {
        validate_workflow_name(name)?;
        let paths = self.paths(name);
        let lock = FileLock::acquire(&paths.lock, self.lock_options)?;

        let prior = self.load_with_origin(name)?.workflow;
        let mut next = prior.clone();
        let value = mutate(&mut next)?;
        refresh_derived(&mut next);
        next.last_updated_at = Utc::now();

        write_atomic(&paths.backup, &to_json_bytes(&prior)?)?;
        write_synced(&paths.staging, &to_json_bytes(&next)?)?;
        debug!(summary = ?next.summary, "update staged");
        Ok(StagedUpdate {
            lock,
            staging: paths.staging,
            status: paths.status,
            workflow: next,
            value,
        })
    }

    /// Atomically apply `mutate` and persist. Returns the new state and the
    /// mutator's value.
    pub fn update_with<T, F>(&self, name: &str, mutate: F) -> Result<(Workflow, T)>
    where
        F: FnOnce(&mut Workflow) -> Result<T>,
    {
        self.stage(name, mutate)?.commit()
    }

    pub fn update<F>(&self, name: &str, mutate: F) -> Result<Workflow>
    where
        F: FnOnce(&mut Workflow) -> Result<()>,
    {
        Ok(self.update_with(name, mutate)?.0)
    }

    pub fn mark_started(&self, name: &str, id: &str) -> Result<Workflow> {
        self.update(name, |wf| transitions::mark_started(wf, id, Utc::now()))
    }

    pub fn mark_completed(
        &self,
        name: &str,
        id: &str,
        notes: Option<String>,
        findings_ref: Option<String>,
    ) -> Result<Workflow> {
        self.update(name, |wf| {
            transitions::mark_completed(wf, id, notes, findings_ref, Utc::now())
        })
    }

    pub fn mark_failed(&self, name: &str, id: &str, error: &str) -> Result<Workflow> {
        self.update(name, |wf| transitions::mark_failed(wf, id, error))
    }

    pub fn mark_skipped(&self, name: &str, id: &str, reason: &str) -> Result<Workflow> {
        self.update(name, |wf| transitions::mark_skipped(wf, id, reason))
    }

    pub fn increment_retry(&self, name: &str, id: &str, error: &str) -> Result<RetryOutcome> {
        let max_retries = self.max_retries;
        let (_, outcome) = self.update_with(name, |wf| {
            transitions::increment_retry(wf, id, error, max_retries)
        })?;
        Ok(outcome)
    }

    pub fn reset_task(&self, name: &str, id: &str) -> Result<Workflow> {
        self.update(name, |wf| transitions::reset_task(wf, id))
    }

    /// Open a new run (closing an orphaned one) and return its id.
    pub fn start_run(&self, name: &str, task_ids: &[String]) -> Result<String> {
        let (_, run_id) =
            self.update_with(name, |wf| Ok(transitions::start_run(wf, task_ids, Utc::now())))?;
        Ok(run_id)
    }

    pub fn complete_run(
        &self,
        name: &str,
        run_id: &str,
        completed: u32,
        failed: u32,
    ) -> Result<Workflow> {
        self.update(name, |wf| {
            transitions::complete_run(wf, run_id, completed, failed, Utc::now())
        })
    }

    /// Fail in-progress tasks older than `threshold_ms` and flag them stuck.
    ///
    /// Checks without the lock first so an idle workflow is never rewritten.
    #[instrument(skip_all, fields(workflow = name, threshold_ms))]
    pub fn detect_stuck(&self, name: &str, threshold_ms: u64) -> Result<Vec<RetryOutcome>> {
        let current = self.load(name)?;
        if transitions::find_stuck(&current, Utc::now(), threshold_ms).is_empty() {
            return Ok(Vec::new());
        }
        let max_retries = self.max_retries;
        let (_, outcomes) = self.update_with(name, |wf| {
            transitions::fail_stuck(wf, Utc::now(), threshold_ms, max_retries)
        })?;
        for outcome in &outcomes {
            warn!(
                task_id = %outcome.task_id,
                retry_count = outcome.retry_count,
                exhausted = outcome.exhausted,
                "stuck task marked failed"
            );
        }
        Ok(outcomes)
    }

    /// Rewrite the status file with recomputed derived fields.
    ///
    /// Only writes when something actually needed repair.
    pub fn repair(&self, name: &str) -> Result<RepairReport> {
        let loaded = self.load_with_origin(name)?;
        let mut warnings = validate_invariants(&loaded.workflow);
        warnings.extend(unknown_dependencies(&loaded.workflow));
        let repaired = loaded.needs_repair();
        if repaired {
            self.update(name, |_| Ok(()))?;
            info!(origin = ?loaded.origin, "workflow state repaired");
        }
        Ok(RepairReport {
            origin: loaded.origin,
            summary_drift: loaded.summary_drift,
            clamped: loaded.clamped,
            warnings,
            repaired,
        })
    }

    pub fn retryable(&self, name: &str) -> Result<Vec<Task>> {
        let workflow = self.load(name)?;
        Ok(transitions::retryable(&workflow).into_iter().cloned().collect())
    }

    pub fn exhausted(&self, name: &str) -> Result<Vec<Task>> {
        let workflow = self.load(name)?;
        Ok(transitions::exhausted(&workflow).into_iter().cloned().collect())
    }

    /// The next `n` selectable tasks, without changing any state.
    pub fn next(&self, name: &str, n: usize, phase_execution: PhaseExecution) -> Result<Vec<Task>> {
        let workflow = self.load(name)?;
        let ids = select_batch(
            &workflow,
            SelectionPolicy {
                batch_size: n,
                phase_execution,
            },
        );
        Ok(ids
            .iter()
            .filter_map(|id| workflow.task(id).cloned())
            .collect())
    }
}

/// Read and fully validate one status file (JSON, schema, invariants).
fn read_status_file(path: &Path) -> Result<Workflow> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let validator = STATUS_VALIDATOR.as_ref().map_err(|e| anyhow!("{e}"))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "schema validation failed for {}:\n- {}",
            path.display(),
            messages.join("\n- ")
        );
    }
    let workflow: Workflow = serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", path.display()))?;
    let errors = validate_invariants(&workflow);
    if !errors.is_empty() {
        bail!(
            "invariant violations in {}:\n- {}",
            path.display(),
            errors.join("\n- ")
        );
    }
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::errors::{InvalidTransitionError, LockTimeoutError};
    use std::sync::Arc;
    use std::thread;

    const PLAN: &str = "## Phase 1: Build\n- [ ] 1.1 First\n- [ ] 1.2 Second\n## Phase 2\n- [ ] 2.1 Third\n";

    fn store(temp: &tempfile::TempDir) -> StatusStore {
        fs::write(temp.path().join("plan.md"), PLAN).expect("write plan");
        let store = StatusStore::new(temp.path(), &Config::default());
        store
            .init("demo", Path::new("plan.md"), false)
            .expect("init");
        store
    }

    #[test]
    fn init_refuses_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        assert!(store.init("demo", Path::new("plan.md"), false).is_err());
        store
            .init("demo", Path::new("plan.md"), true)
            .expect("forced init");
        assert_eq!(store.list_workflows().expect("list"), vec!["demo".to_string()]);
    }

    #[test]
    fn reload_is_idempotent_and_summary_matches_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.mark_started("demo", "1.1").expect("start");

        let first = store.load("demo").expect("load");
        let second = store.load("demo").expect("load again");
        assert_eq!(first, second);
        assert_eq!(first.summary.in_progress, 1);
        assert_eq!(first.summary.pending, 2);
        assert_eq!(first.current_phase.as_deref(), Some("1"));
    }

    #[test]
    fn hand_edited_summary_is_recomputed_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        let path = store.paths("demo").status;
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        value["summary"]["completed"] = Value::from(3);
        fs::write(&path, serde_json::to_vec(&value).expect("ser")).expect("write");

        let loaded = store.load_with_origin("demo").expect("load");
        assert!(loaded.summary_drift);
        assert_eq!(loaded.workflow.summary.completed, 0);

        let report = store.repair("demo").expect("repair");
        assert!(report.repaired);
        assert!(!store.load_with_origin("demo").expect("reload").summary_drift);
    }

    #[test]
    fn abandoned_stage_leaves_primary_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        let before = fs::read(store.paths("demo").status).expect("read before");

        let staged = store
            .stage("demo", |wf| transitions::mark_started(wf, "1.1", Utc::now()))
            .expect("stage");
        assert!(store.paths("demo").backup.exists());
        assert!(store.paths("demo").staging.exists());
        drop(staged);

        assert_eq!(fs::read(store.paths("demo").status).expect("read after"), before);
        let loaded = store.load("demo").expect("load");
        assert_eq!(loaded.task("1.1").map(|t| t.status), Some(TaskStatus::Pending));
        let _free = FileLock::acquire(&store.paths("demo").lock, LockOptions::from_millis(50, 60_000))
            .expect("lock released with the abandoned stage");
    }

    #[test]
    fn failed_mutator_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        let err = store
            .mark_completed("demo", "1.1", None, None)
            .expect_err("pending cannot complete");
        assert!(err.downcast_ref::<InvalidTransitionError>().is_some());
        assert!(!store.paths("demo").backup.exists());
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.mark_started("demo", "1.1").expect("start");
        store.mark_started("demo", "1.2").expect("start");
        fs::write(store.paths("demo").status, b"{ not json").expect("corrupt");

        let loaded = store.load_with_origin("demo").expect("load");
        assert_eq!(loaded.origin, LoadOrigin::Backup);
        assert_eq!(loaded.workflow.summary.in_progress, 1);
    }

    #[test]
    fn missing_state_is_reconstructed_from_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.mark_started("demo", "1.1").expect("start");
        fs::write(store.paths("demo").status, b"[]").expect("corrupt primary");
        fs::remove_file(store.paths("demo").backup).expect("remove backup");

        let loaded = store.load_with_origin("demo").expect("load");
        assert_eq!(loaded.origin, LoadOrigin::Reconstructed);
        assert_eq!(loaded.workflow.summary.pending, 3);
    }

    #[test]
    fn unknown_workflow_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StatusStore::new(temp.path(), &Config::default());
        let err = store.load("ghost").expect_err("missing");
        assert!(err.downcast_ref::<WorkflowNotFoundError>().is_some());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store(&temp));
        let threads = 8;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .update("demo", |wf| {
                            let task = wf.task_mut("1.1").expect("task");
                            let count: u32 = task.notes.as_deref().unwrap_or("0").parse()?;
                            task.notes = Some((count + 1).to_string());
                            Ok(())
                        })
                        .expect("update");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let workflow = store.load("demo").expect("load");
        assert_eq!(
            workflow.task("1.1").and_then(|t| t.notes.clone()),
            Some(threads.to_string())
        );
    }

    #[test]
    fn held_lock_surfaces_lock_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("plan.md"), PLAN).expect("write plan");
        let config = Config {
            lock_timeout_ms: 50,
            ..Config::default()
        };
        let store = StatusStore::new(temp.path(), &config);
        store.init("demo", Path::new("plan.md"), false).expect("init");

        let _held = FileLock::acquire(&store.paths("demo").lock, config.lock_options()).expect("hold");
        let err = store.mark_started("demo", "1.1").expect_err("contended");
        assert!(err.downcast_ref::<LockTimeoutError>().is_some());
    }

    #[test]
    fn stuck_detection_and_retry_queries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.mark_started("demo", "1.1").expect("start");

        assert!(store.detect_stuck("demo", 60_000).expect("detect").is_empty());
        thread::sleep(std::time::Duration::from_millis(20));
        let outcomes = store.detect_stuck("demo", 5).expect("detect");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(store.retryable("demo").expect("retryable").len(), 1);

        for _ in 0..2 {
            store.mark_started("demo", "1.1").expect("restart");
            store.increment_retry("demo", "1.1", "boom").expect("fail");
        }
        let task = store.load("demo").expect("load").task("1.1").cloned().expect("task");
        assert_eq!(task.retry_count, 2);
        assert!(task.exhausted);
        assert!(store.retryable("demo").expect("retryable").is_empty());
        assert_eq!(store.exhausted("demo").expect("exhausted").len(), 1);
    }
}
