//! Reader for the markdown task-definition document.
//!
//! The document is read-only input. Recognized lines:
//!
//! ```text
//! ## Phase 1: Storage
//! - [ ] 1.1 Add the lock module [files: src/lock.rs]
//! - [x] **1.2** Wire the store (depends: 1.1)
//! ```
//!
//! Checkbox state is ignored; every task starts `pending`. Tasks before the
//! first phase heading belong to phase `0`. A checkbox without an id gets
//! `<phase>.<n>` by position.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::Task;

static PHASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{1,4}\s+Phase\s+(?P<id>[A-Za-z0-9][\w.-]*)\s*(?::\s*(?P<title>.*?))?\s*$")
        .expect("valid phase regex")
});

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[[ xX]\]\s+(?P<rest>.*)$").expect("valid task regex")
});

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\*\*)?(?P<id>[A-Za-z]?\d+(?:\.\d+)*[a-z]?)(?:\*\*)?:?(?:\s+|$)")
        .expect("valid task id regex")
});

static DEPENDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*depends(?:\s+on)?\s*:\s*(?P<list>[^)]*)\)").expect("valid depends regex")
});

static FILES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*files\s*:\s*(?P<list>[^\]]*)\]").expect("valid files regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseInfo {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDocument {
    pub phases: Vec<PhaseInfo>,
    pub tasks: Vec<Task>,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a plan document. Fails on duplicate task ids.
pub fn parse_plan(content: &str) -> Result<PlanDocument> {
    let mut phases: Vec<PhaseInfo> = Vec::new();
    let mut tasks: Vec<Task> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut phase_id = "0".to_string();
    let mut position_in_phase = 0usize;

    for (index, line) in content.lines().enumerate() {
        if let Some(caps) = PHASE_RE.captures(line) {
            phase_id = caps["id"].to_string();
            position_in_phase = 0;
            phases.push(PhaseInfo {
                id: phase_id.clone(),
                title: caps
                    .name("title")
                    .map(|m| m.as_str().to_string())
                    .filter(|t| !t.is_empty()),
            });
            continue;
        }
        let Some(caps) = TASK_RE.captures(line) else {
            continue;
        };
        position_in_phase += 1;
        let mut rest = caps["rest"].to_string();

        let depends_on = DEPENDS_RE
            .captures(&rest)
            .map(|c| split_list(&c["list"]))
            .unwrap_or_default();
        let files = FILES_RE
            .captures(&rest)
            .map(|c| split_list(&c["list"]))
            .unwrap_or_default();
        rest = DEPENDS_RE.replace_all(&rest, "").to_string();
        rest = FILES_RE.replace_all(&rest, "").to_string();

        let (id, description) = match ID_RE.captures(&rest) {
            Some(id_caps) => {
                let whole = id_caps.get(0).map_or(0, |m| m.end());
                (id_caps["id"].to_string(), rest[whole..].trim().to_string())
            }
            None => (format!("{phase_id}.{position_in_phase}"), rest.trim().to_string()),
        };

        if !seen.insert(id.clone()) {
            bail!("line {}: duplicate task id '{}'", index + 1, id);
        }
        let description = description
            .trim_start_matches(['-', ':'])
            .trim()
            .to_string();
        if phases.is_empty() {
            phases.push(PhaseInfo {
                id: phase_id.clone(),
                title: None,
            });
        }
        let mut task = Task::new(id, phase_id.clone(), description);
        task.depends_on = depends_on;
        task.files = files;
        tasks.push(task);
    }

    Ok(PlanDocument { phases, tasks })
}

/// Read and parse the plan document at `path`.
pub fn read_plan(path: &Path) -> Result<PlanDocument> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan = parse_plan(&content).with_context(|| format!("parse plan {}", path.display()))?;
    debug!(
        path = %path.display(),
        phases = plan.phases.len(),
        tasks = plan.tasks.len(),
        "plan parsed"
    );
    Ok(plan)
}
