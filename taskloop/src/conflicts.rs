//! Conflict detection between concurrent workflow branches.
//!
//! Gathers per-branch diffs from git and hands them to `core::conflict` for
//! grading and ranking. Read-only: no ref, index, or working-tree file changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument, warn};

use crate::core::conflict::{
    BranchChanges, ConflictReport, FileChange, MergePreview, PairOverlap, build_report,
    detect_overlap, parse_conflict_hunks, recommend_merge_order,
};
use crate::core::types::{Summary, Workflow};
use crate::io::git::{Git, parse_unified_zero};

/// Branch prefix naming the workflow a branch carries (`taskloop/<workflow>`).
pub const BRANCH_PREFIX: &str = "taskloop/";

const WORKFLOWS_TREE_DIR: &str = ".taskloop/workflows";

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    git: Git,
    base: String,
}

impl ConflictDetector {
    pub fn new(workdir: impl Into<PathBuf>, base: &str) -> Self {
        Self {
            git: Git::new(workdir),
            base: base.to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Modified files (with base-side line ranges where known) of one branch.
    #[instrument(skip_all, fields(branch))]
    pub fn branch_changes(&self, branch: &str) -> Result<BranchChanges> {
        self.git.resolve_commit(branch)?;
        let fork_point = self
            .git
            .merge_base(&self.base, branch)
            .with_context(|| format!("find merge base of {} and {branch}", self.base))?;
        let ranges = parse_unified_zero(&self.git.diff_unified_zero(&fork_point, branch)?);
        let numstat = self.git.numstat(&fork_point, branch)?;

        let mut files = BTreeMap::new();
        for entry in numstat {
            let known = if entry.is_binary() {
                None
            } else {
                ranges
                    .get(&entry.path)
                    .cloned()
                    .flatten()
                    .filter(|r| !r.is_empty())
            };
            files.insert(
                entry.path.clone(),
                FileChange {
                    added: entry.added.unwrap_or(0),
                    removed: entry.removed.unwrap_or(0),
                    ranges: known,
                    path: entry.path,
                },
            );
        }
        let completion = self.branch_completion(branch);
        debug!(files = files.len(), completion, "branch changes collected");
        Ok(BranchChanges {
            branch: branch.to_string(),
            completion,
            files,
        })
    }

    pub fn file_modification_map(&self, branches: &[String]) -> Result<Vec<BranchChanges>> {
        if branches.is_empty() {
            bail!("no branches given");
        }
        branches
            .iter()
            .map(|branch| self.branch_changes(branch))
            .collect()
    }

    pub fn detect_overlap(&self, a: &str, b: &str) -> Result<PairOverlap> {
        Ok(detect_overlap(
            &self.branch_changes(a)?,
            &self.branch_changes(b)?,
        ))
    }

    pub fn recommend_merge_order(&self, branches: &[String]) -> Result<Vec<String>> {
        Ok(recommend_merge_order(&self.file_modification_map(branches)?))
    }

    /// Full report: shared files, pairwise severity, and merge order.
    pub fn report(&self, branches: &[String]) -> Result<ConflictReport> {
        Ok(build_report(&self.base, &self.file_modification_map(branches)?))
    }

    /// Simulate merging `b` into `a` and collect the conflicting hunks.
    #[instrument(skip_all, fields(a, b))]
    pub fn preview_merge(&self, a: &str, b: &str) -> Result<MergePreview> {
        self.git.resolve_commit(a)?;
        self.git.resolve_commit(b)?;
        let merged = self.git.merge_tree(a, b)?;
        let mut hunks = Vec::new();
        for path in &merged.conflicted_files {
            match self.git.cat_file(&format!("{}:{path}", merged.tree)) {
                Ok(content) => hunks.extend(parse_conflict_hunks(path, &content)),
                // Modify/delete conflicts leave no file with markers.
                Err(e) => debug!(path = %path, err = %e, "no merged content for conflicted path"),
            }
        }
        Ok(MergePreview {
            a: a.to_string(),
            b: b.to_string(),
            clean: merged.clean,
            conflicted_files: merged.conflicted_files,
            hunks,
        })
    }

    /// Completion percent of the workflow committed on `branch`, 0.0 when unknown.
    pub fn branch_completion(&self, branch: &str) -> f64 {
        match self.read_branch_completion(branch) {
            Ok(Some(percent)) => percent,
            Ok(None) => 0.0,
            Err(e) => {
                warn!(branch, err = %format!("{e:#}"), "cannot read workflow status on branch");
                0.0
            }
        }
    }

    fn read_branch_completion(&self, branch: &str) -> Result<Option<f64>> {
        let Some(workflow) = self.branch_workflow(branch)? else {
            return Ok(None);
        };
        let path = format!("{WORKFLOWS_TREE_DIR}/{workflow}/status.json");
        let Some(raw) = self.git.show_file(branch, &path)? else {
            return Ok(None);
        };
        let state: Workflow =
            serde_json::from_str(&raw).with_context(|| format!("parse {branch}:{path}"))?;
        Ok(Some(Summary::from_tasks(&state.tasks).completion_percent()))
    }

    /// `taskloop/<wf>` names the workflow; otherwise the branch must carry exactly one.
    fn branch_workflow(&self, branch: &str) -> Result<Option<String>> {
        let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        if let Some(name) = short.strip_prefix(BRANCH_PREFIX)
            && !name.is_empty()
        {
            return Ok(Some(name.to_string()));
        }
        let mut workflows = self.git.ls_tree(branch, WORKFLOWS_TREE_DIR)?;
        if workflows.len() == 1 {
            return Ok(workflows.pop());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::Severity;
    use crate::test_support::{TestRepo, numbered_lines};

    fn repo_with_base() -> TestRepo {
        let repo = TestRepo::new().expect("repo");
        repo.write("src/shared.txt", &numbered_lines(40)).expect("write");
        repo.write("README.md", "readme\n").expect("write");
        repo.commit("base").expect("commit");
        repo
    }

    fn edit_line(content: &str, line: usize, replacement: &str) -> String {
        content
            .lines()
            .enumerate()
            .map(|(i, l)| {
                if i + 1 == line {
                    format!("{replacement}\n")
                } else {
                    format!("{l}\n")
                }
            })
            .collect()
    }

    #[test]
    fn disjoint_and_overlapping_edits_grade_low_and_high() {
        let repo = repo_with_base();
        let base = numbered_lines(40);

        repo.checkout_new("taskloop/a", "main").expect("branch a");
        repo.write("src/shared.txt", &edit_line(&base, 5, "a edit")).expect("write");
        repo.commit("a").expect("commit");

        repo.checkout_new("taskloop/b", "main").expect("branch b");
        repo.write("src/shared.txt", &edit_line(&base, 30, "b edit")).expect("write");
        repo.commit("b").expect("commit");

        repo.checkout_new("taskloop/c", "main").expect("branch c");
        repo.write("src/shared.txt", &edit_line(&base, 5, "c edit")).expect("write");
        repo.commit("c").expect("commit");

        repo.checkout_new("taskloop/d", "main").expect("branch d");
        repo.write("docs/other.md", "other\n").expect("write");
        repo.commit("d").expect("commit");
        repo.checkout("main").expect("back to main");

        let detector = ConflictDetector::new(repo.root(), "main");
        assert_eq!(
            detector.detect_overlap("taskloop/a", "taskloop/b").expect("a-b").severity,
            Severity::Low
        );
        assert_eq!(
            detector.detect_overlap("taskloop/a", "taskloop/c").expect("a-c").severity,
            Severity::High
        );
        let disjoint = detector.detect_overlap("taskloop/a", "taskloop/d").expect("a-d");
        assert_eq!(disjoint.severity, Severity::None);
        assert!(disjoint.files.is_empty());

        let branches: Vec<String> = ["taskloop/a", "taskloop/b", "taskloop/d"]
            .iter()
            .map(|b| b.to_string())
            .collect();
        let first = detector.recommend_merge_order(&branches).expect("order");
        let second = detector.recommend_merge_order(&branches).expect("order again");
        assert_eq!(first, second);
        assert_eq!(first[0], "taskloop/d");
    }

    #[test]
    fn completion_comes_from_committed_status_file() {
        let repo = repo_with_base();
        repo.checkout_new("taskloop/auth", "main").expect("branch");
        let mut wf = Workflow::new(
            "auth",
            "plan.md",
            vec![
                crate::core::types::Task::new("1.1", "1", "a"),
                crate::core::types::Task::new("1.2", "1", "b"),
            ],
            chrono::Utc::now(),
        );
        wf.tasks[0].status = crate::core::types::TaskStatus::Completed;
        repo.write(
            ".taskloop/workflows/auth/status.json",
            &serde_json::to_string_pretty(&wf).expect("json"),
        )
        .expect("write status");
        repo.commit("status").expect("commit");
        repo.checkout("main").expect("main");

        let detector = ConflictDetector::new(repo.root(), "main");
        assert_eq!(detector.branch_completion("taskloop/auth"), 50.0);
        assert_eq!(detector.branch_completion("main"), 0.0);
    }

    #[test]
    fn preview_reports_conflicting_hunks_without_touching_refs() {
        let repo = repo_with_base();
        let base = numbered_lines(40);
        repo.checkout_new("left", "main").expect("left");
        repo.write("src/shared.txt", &edit_line(&base, 10, "left side")).expect("write");
        repo.commit("left").expect("commit");
        repo.checkout_new("right", "main").expect("right");
        repo.write("src/shared.txt", &edit_line(&base, 10, "right side")).expect("write");
        repo.commit("right").expect("commit");
        let head_before = repo.git(&["rev-parse", "HEAD"]).expect("head");

        let detector = ConflictDetector::new(repo.root(), "main");
        let preview = detector.preview_merge("left", "right").expect("preview");

        assert!(!preview.clean);
        assert_eq!(preview.conflicted_files, vec!["src/shared.txt"]);
        assert_eq!(preview.hunks.len(), 1);
        assert_eq!(preview.hunks[0].ours, "left side\n");
        assert_eq!(preview.hunks[0].theirs, "right side\n");
        assert_eq!(repo.git(&["rev-parse", "HEAD"]).expect("head"), head_before);
        assert!(repo.git(&["status", "--porcelain"]).expect("status").trim().is_empty());
    }

    #[test]
    fn unknown_branch_is_an_error() {
        let repo = repo_with_base();
        let detector = ConflictDetector::new(repo.root(), "main");
        assert!(detector.branch_changes("nope").is_err());
    }
}
