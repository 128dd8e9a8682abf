//! Process-wide registry of running orchestrators.
//!
//! One JSON object keyed by workflow name, stored at
//! `<registry_dir>/instances.json` and rewritten atomically under
//! `<registry_dir>/instances.lock`. At most one live entry exists per
//! workflow; entries whose process has died are purged whenever they are seen.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::OrchestratorMode;
use crate::errors::DuplicateWorkflowError;
use crate::io::atomic::write_json_atomic;
use crate::io::lock::{FileLock, LockOptions};
use crate::io::process::is_process_alive;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub workflow_name: String,
    pub process_id: u32,
    pub mode: OrchestratorMode,
    /// Workspace root the orchestrator runs in.
    pub workspace_ref: PathBuf,
    pub started_at: DateTime<Utc>,
    pub control_socket: PathBuf,
}

/// A registry entry as reported by [`Registry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub alive: bool,
}

type Entries = BTreeMap<String, InstanceRecord>;

#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    lock_options: LockOptions,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        Self {
            dir: dir.into(),
            lock_options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self) -> PathBuf {
        self.dir.join("instances.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("instances.lock")
    }

    /// Claim `record.workflow_name` for `record.process_id`.
    ///
    /// Fails with [`DuplicateWorkflowError`] when a live process holds it; a
    /// dead holder's entry is replaced.
    #[instrument(skip_all, fields(workflow = %record.workflow_name, pid = record.process_id))]
    pub fn register(&self, record: InstanceRecord) -> Result<()> {
        self.modify(|entries| {
            if let Some(existing) = entries.get(&record.workflow_name) {
                if is_process_alive(existing.process_id) {
                    return Err(DuplicateWorkflowError {
                        workflow: record.workflow_name.clone(),
                        pid: existing.process_id,
                    }
                    .into());
                }
                warn!(
                    stale_pid = existing.process_id,
                    "purging registry entry of dead orchestrator"
                );
            }
            entries.insert(record.workflow_name.clone(), record);
            Ok(true)
        })?;
        debug!("registered orchestrator");
        Ok(())
    }

    /// Remove the entry for `workflow`. Missing entries are fine.
    ///
    /// With `only_pid`, an entry owned by a different process is left alone.
    pub fn unregister(&self, workflow: &str, only_pid: Option<u32>) -> Result<bool> {
        self.modify(|entries| {
            let owned = entries
                .get(workflow)
                .is_some_and(|entry| only_pid.is_none_or(|pid| entry.process_id == pid));
            if owned {
                entries.remove(workflow);
            }
            Ok(owned)
        })
    }

    /// All entries with their liveness. Dead entries are purged from the file.
    pub fn list(&self) -> Result<Vec<InstanceStatus>> {
        let mut listed = Vec::new();
        self.modify(|entries| {
            let before = entries.len();
            for record in entries.values() {
                listed.push(InstanceStatus {
                    alive: is_process_alive(record.process_id),
                    record: record.clone(),
                });
            }
            entries.retain(|_, record| {
                let keep = listed
                    .iter()
                    .any(|s| s.alive && s.record.workflow_name == record.workflow_name);
                if !keep {
                    warn!(workflow = %record.workflow_name, pid = record.process_id, "purging dead registry entry");
                }
                keep
            });
            Ok(entries.len() != before)
        })?;
        Ok(listed)
    }

    /// The live entry for `workflow`, if any.
    pub fn get(&self, workflow: &str) -> Result<Option<InstanceRecord>> {
        let entries = self.read()?;
        Ok(entries
            .get(workflow)
            .filter(|record| is_process_alive(record.process_id))
            .cloned())
    }

    /// Run `f` on the entries under the registry lock; persist when it returns true.
    fn modify<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Entries) -> Result<bool>,
    {
        let lock = FileLock::acquire(&self.lock_path(), self.lock_options)?;
        let mut entries = self.read()?;
        let changed = f(&mut entries)?;
        if changed {
            write_json_atomic(&self.file(), &entries)?;
        }
        lock.release()?;
        Ok(changed)
    }

    fn read(&self) -> Result<Entries> {
        let path = self.file();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Entries::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        // A corrupt file may still name live orchestrators; never read it as empty.
        serde_json::from_str(&raw).with_context(|| {
            format!(
                "registry {} is corrupt; repair or remove it once no orchestrator is running",
                path.display()
            )
        })
    }
}
