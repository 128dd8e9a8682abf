//! Overlap analysis between concurrent branches.
//!
//! Everything here works on already-collected diff data; `crate::conflicts`
//! gathers that data from git. Line ranges are half-open and expressed in the
//! coordinates of the common base, so ranges from different branches compare
//! directly.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Base-side lines touched by one hunk: `[start, end)`, 1-indexed.
///
/// A pure insertion has `start == end` and sits between lines `start - 1`
/// and `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Build from a unified diff hunk header's old side (`-start,count`).
    pub fn from_hunk(old_start: u32, old_count: u32) -> Self {
        if old_count == 0 {
            // `-s,0` means "insert after line s".
            let point = old_start + 1;
            Self {
                start: point,
                end: point,
            }
        } else {
            Self {
                start: old_start,
                end: old_start + old_count,
            }
        }
    }

    pub fn is_insertion(&self) -> bool {
        self.start == self.end
    }

    pub fn overlaps(&self, other: &LineRange) -> bool {
        match (self.is_insertion(), other.is_insertion()) {
            (false, false) => self.start < other.end && other.start < self.end,
            (true, false) => other.start < self.start && self.start < other.end,
            (false, true) => self.start < other.start && other.start < self.end,
            (true, true) => self.start == other.start,
        }
    }
}

/// How one branch changed one file relative to the base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    /// `None` when line ranges are unknown (binary, mode-only, file deleted).
    pub ranges: Option<Vec<LineRange>>,
    pub added: u64,
    pub removed: u64,
}

impl FileChange {
    pub fn volume(&self) -> u64 {
        self.added + self.removed
    }
}

/// All changes one branch makes relative to the base.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchChanges {
    pub branch: String,
    /// Completion of the branch's workflow in percent (0.0 when unknown).
    pub completion: f64,
    pub files: BTreeMap<String, FileChange>,
}

impl BranchChanges {
    pub fn volume(&self) -> u64 {
        self.files.values().map(FileChange::volume).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
}

/// Severity of two branches touching the same file.
pub fn file_severity(a: &FileChange, b: &FileChange) -> Severity {
    match (&a.ranges, &b.ranges) {
        (Some(left), Some(right)) => {
            let intersects = left
                .iter()
                .any(|l| right.iter().any(|r| l.overlaps(r)));
            if intersects {
                Severity::High
            } else {
                Severity::Low
            }
        }
        _ => Severity::Medium,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOverlap {
    pub path: String,
    pub severity: Severity,
}

/// Overlap between one pair of branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairOverlap {
    pub a: String,
    pub b: String,
    pub files: Vec<FileOverlap>,
    /// Maximum over `files`; `none` when no file is shared.
    pub severity: Severity,
}

/// Intersect the modified-file sets of two branches and grade each shared file.
pub fn detect_overlap(a: &BranchChanges, b: &BranchChanges) -> PairOverlap {
    let files: Vec<FileOverlap> = a
        .files
        .iter()
        .filter_map(|(path, change_a)| {
            b.files.get(path).map(|change_b| FileOverlap {
                path: path.clone(),
                severity: file_severity(change_a, change_b),
            })
        })
        .collect();
    let severity = files
        .iter()
        .map(|file| file.severity)
        .max()
        .unwrap_or(Severity::None);
    PairOverlap {
        a: a.branch.clone(),
        b: b.branch.clone(),
        files,
        severity,
    }
}

/// Inputs to the merge-order ranking for one branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeScore {
    pub branch: String,
    pub completion: f64,
    /// Distinct files this branch shares with any other branch.
    pub conflicting_files: usize,
    pub volume: u64,
}

fn merge_scores(branches: &[BranchChanges]) -> Vec<MergeScore> {
    branches
        .iter()
        .map(|branch| {
            let conflicting: BTreeSet<&str> = branch
                .files
                .keys()
                .filter(|path| {
                    branches
                        .iter()
                        .any(|other| other.branch != branch.branch && other.files.contains_key(*path))
                })
                .map(String::as_str)
                .collect();
            MergeScore {
                branch: branch.branch.clone(),
                completion: branch.completion,
                conflicting_files: conflicting.len(),
                volume: branch.volume(),
            }
        })
        .collect()
}

fn compare_scores(a: &MergeScore, b: &MergeScore) -> Ordering {
    b.completion
        .total_cmp(&a.completion)
        .then(a.conflicting_files.cmp(&b.conflicting_files))
        .then(a.volume.cmp(&b.volume))
        .then_with(|| a.branch.cmp(&b.branch))
}

/// Total merge order: higher completion first, then fewer conflicting files,
/// then smaller change volume, then branch name.
pub fn recommend_merge_order(branches: &[BranchChanges]) -> Vec<String> {
    let mut scores = merge_scores(branches);
    scores.sort_by(compare_scores);
    scores.into_iter().map(|score| score.branch).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictReport {
    pub base: String,
    pub branches: Vec<String>,
    /// Files touched by more than one branch, with the branches touching them.
    pub file_overlaps: BTreeMap<String, Vec<String>>,
    /// Maximum severity over all pairs.
    pub severity: Severity,
    pub pairs: Vec<PairOverlap>,
    pub recommended_merge_order: Vec<String>,
    pub merge_scores: Vec<MergeScore>,
}

/// Compare every pair of branches and rank them for merging.
pub fn build_report(base: &str, branches: &[BranchChanges]) -> ConflictReport {
    let mut touched: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for branch in branches {
        for path in branch.files.keys() {
            touched
                .entry(path.clone())
                .or_default()
                .push(branch.branch.clone());
        }
    }
    touched.retain(|_, owners| owners.len() > 1);

    let mut pairs = Vec::new();
    for (i, a) in branches.iter().enumerate() {
        for b in &branches[i + 1..] {
            pairs.push(detect_overlap(a, b));
        }
    }
    let severity = pairs
        .iter()
        .map(|pair| pair.severity)
        .max()
        .unwrap_or(Severity::None);

    let mut scores = merge_scores(branches);
    scores.sort_by(compare_scores);

    ConflictReport {
        base: base.to_string(),
        branches: branches.iter().map(|branch| branch.branch.clone()).collect(),
        file_overlaps: touched,
        severity,
        pairs,
        recommended_merge_order: scores.iter().map(|score| score.branch.clone()).collect(),
        merge_scores: scores,
    }
}

/// One conflicted region of a simulated merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictHunk {
    pub path: String,
    pub ours: String,
    pub theirs: String,
}

/// Result of a non-destructive merge simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePreview {
    pub a: String,
    pub b: String,
    pub clean: bool,
    pub conflicted_files: Vec<String>,
    pub hunks: Vec<ConflictHunk>,
}

/// Extract conflict regions from a file containing merge conflict markers.
///
/// Handles both the default and the diff3 style (the `|||||||` base section
/// is dropped).
pub fn parse_conflict_hunks(path: &str, content: &str) -> Vec<ConflictHunk> {
    enum Section {
        Outside,
        Ours,
        Base,
        Theirs,
    }

    let mut hunks = Vec::new();
    let mut section = Section::Outside;
    let mut ours = String::new();
    let mut theirs = String::new();
    for line in content.lines() {
        match section {
            Section::Outside => {
                if line.starts_with("<<<<<<<") {
                    section = Section::Ours;
                    ours.clear();
                    theirs.clear();
                }
            }
            Section::Ours | Section::Base if line.starts_with("=======") => {
                section = Section::Theirs;
            }
            Section::Ours if line.starts_with("|||||||") => section = Section::Base,
            Section::Ours => {
                ours.push_str(line);
                ours.push('\n');
            }
            Section::Base => {}
            Section::Theirs => {
                if line.starts_with(">>>>>>>") {
                    hunks.push(ConflictHunk {
                        path: path.to_string(),
                        ours: std::mem::take(&mut ours),
                        theirs: std::mem::take(&mut theirs),
                    });
                    section = Section::Outside;
                } else {
                    theirs.push_str(line);
                    theirs.push('\n');
                }
            }
        }
    }
    hunks
}
