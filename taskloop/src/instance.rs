//! Registration of a running orchestrator.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::types::OrchestratorMode;
use crate::io::registry::{InstanceRecord, Registry};

/// Holds a workflow's registry entry for as long as it lives.
///
/// Unregisters on drop, so a loop that returns early or panics still frees
/// the workflow for the next orchestrator.
#[derive(Debug)]
pub struct InstanceGuard {
    registry: Registry,
    workflow: String,
    pid: u32,
}

impl InstanceGuard {
    /// Register the current process for `workflow`.
    ///
    /// Fails with `DuplicateWorkflowError` while another live process holds it.
    pub fn acquire(
        registry: Registry,
        workflow: &str,
        mode: OrchestratorMode,
        workspace: &Path,
        control_socket: &Path,
    ) -> Result<Self> {
        let pid = std::process::id();
        registry.register(InstanceRecord {
            workflow_name: workflow.to_string(),
            process_id: pid,
            mode,
            workspace_ref: workspace.to_path_buf(),
            started_at: Utc::now(),
            control_socket: control_socket.to_path_buf(),
        })?;
        info!(workflow, pid, "orchestrator registered");
        Ok(Self {
            registry,
            workflow: workflow.to_string(),
            pid,
        })
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registry.unregister(&self.workflow, Some(self.pid)) {
            warn!(workflow = %self.workflow, err = %e, "failed to unregister orchestrator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_duplicate;
    use crate::io::lock::LockOptions;

    #[test]
    fn guard_blocks_second_orchestrator_until_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::new(temp.path(), LockOptions::from_millis(1_000, 60_000));
        let acquire = || {
            InstanceGuard::acquire(
                registry.clone(),
                "w",
                OrchestratorMode::Batch,
                temp.path(),
                &temp.path().join("control.sock"),
            )
        };

        let guard = acquire().expect("first");
        assert_eq!(guard.workflow(), "w");
        let err = acquire().expect_err("duplicate");
        assert!(as_duplicate(&err).is_some());

        drop(guard);
        assert!(registry.get("w").expect("get").is_none());
        let _again = acquire().expect("after drop");
    }
}
