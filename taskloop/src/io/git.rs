//! Git adapter for conflict analysis.
//!
//! Only read-only queries: nothing here moves a ref, touches the index or
//! writes to the working tree. `merge-tree --write-tree` writes objects to
//! the object store, which no ref points at.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::conflict::LineRange;

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(?P<start>\d+)(?:,(?P<count>\d+))? \+\d+(?:,\d+)? @@")
        .expect("valid hunk header regex")
});

/// One `git diff --numstat` row. Binary files have no line counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumstatEntry {
    pub path: String,
    pub added: Option<u64>,
    pub removed: Option<u64>,
}

impl NumstatEntry {
    pub fn is_binary(&self) -> bool {
        self.added.is_none() || self.removed.is_none()
    }
}

/// Result of a simulated merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTree {
    pub clean: bool,
    /// Tree object holding the merge result, conflict markers included.
    pub tree: String,
    pub conflicted_files: Vec<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve `rev` to a commit id.
    pub fn resolve_commit(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self
            .run_capture(&["rev-parse", "--verify", "--quiet", &spec])
            .with_context(|| format!("unknown revision '{rev}'"))?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all, fields(a, b))]
    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let out = self.run_capture(&["merge-base", a, b])?;
        let base = out.trim().to_string();
        debug!(base = %base, "merge base");
        Ok(base)
    }

    /// Zero-context diff from `base` to `branch`, renames reported as delete + add.
    pub fn diff_unified_zero(&self, base: &str, branch: &str) -> Result<String> {
        self.run_capture(&[
            "diff",
            "--unified=0",
            "--no-renames",
            "--no-color",
            "--no-ext-diff",
            base,
            branch,
        ])
    }

    pub fn numstat(&self, base: &str, branch: &str) -> Result<Vec<NumstatEntry>> {
        let out = self.run_capture(&["diff", "--numstat", "--no-renames", base, branch])?;
        parse_numstat(&out)
    }

    /// Names directly under `dir` in `rev`'s tree. Empty when `dir` is absent.
    pub fn ls_tree(&self, rev: &str, dir: &str) -> Result<Vec<String>> {
        let spec = format!("{}/", dir.trim_end_matches('/'));
        let out = self.run_capture(&["ls-tree", "--name-only", rev, &spec])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.rsplit('/')
                    .next()
                    .unwrap_or(line)
                    .to_string()
            })
            .collect())
    }

    /// Contents of `path` at `rev`, or `None` if it does not exist there.
    pub fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>> {
        let spec = format!("{rev}:{path}");
        let output = self.run(&["cat-file", "-e", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        self.cat_file(&spec).map(Some)
    }

    /// `git cat-file -p <object>`.
    pub fn cat_file(&self, object: &str) -> Result<String> {
        self.run_capture(&["cat-file", "-p", object])
    }

    /// Simulate merging `b` into `a` without touching refs or the worktree.
    ///
    /// Requires git 2.38 or newer. Exit status 1 means conflicts, not failure.
    #[instrument(skip_all, fields(a, b))]
    pub fn merge_tree(&self, a: &str, b: &str) -> Result<MergeTree> {
        let args = ["merge-tree", "--write-tree", "--name-only", "--no-messages", a, b];
        let output = self.run(&args)?;
        let clean = match output.status.code() {
            Some(0) => true,
            Some(1) => false,
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow!(
                    "git {} failed (git 2.38+ required): {}",
                    args.join(" "),
                    stderr.trim()
                ));
            }
        };
        let merged = parse_merge_tree(&String::from_utf8_lossy(&output.stdout), clean)?;
        debug!(clean, conflicted = merged.conflicted_files.len(), "merge simulated");
        Ok(merged)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Base-side line ranges per file from a `--unified=0` diff.
///
/// Files without hunks (mode changes, binaries) map to an empty list, and
/// deleted files map to `None`.
pub fn parse_unified_zero(diff: &str) -> BTreeMap<String, Option<Vec<LineRange>>> {
    let mut files: BTreeMap<String, Option<Vec<LineRange>>> = BTreeMap::new();
    let mut old_path: Option<String> = None;
    let mut current: Option<String> = None;
    // `---`/`+++` are file headers only between `diff --git` and the first hunk.
    let mut in_header = false;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            old_path = None;
            current = None;
            in_header = true;
        } else if in_header && let Some(path) = line.strip_prefix("--- ") {
            old_path = strip_side(path, "a/");
        } else if in_header && let Some(path) = line.strip_prefix("+++ ") {
            match strip_side(path, "b/") {
                Some(new_path) => {
                    files.entry(new_path.clone()).or_insert_with(|| Some(Vec::new()));
                    current = Some(new_path);
                }
                None => {
                    // Deleted: every base line goes away.
                    if let Some(old) = old_path.take() {
                        files.insert(old, None);
                    }
                    current = None;
                }
            }
        } else if let Some(caps) = HUNK_RE.captures(line) {
            in_header = false;
            let Some(path) = &current else { continue };
            let start = caps["start"].parse::<u32>().unwrap_or(0);
            let count = caps
                .name("count")
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(1);
            if let Some(Some(ranges)) = files.get_mut(path) {
                ranges.push(LineRange::from_hunk(start, count));
            }
        }
    }
    files
}

fn strip_side(path: &str, prefix: &str) -> Option<String> {
    let path = path.trim_end_matches(['\t', '\r']);
    if path == "/dev/null" {
        return None;
    }
    let path = unquote_path(path);
    Some(path.strip_prefix(prefix).map(str::to_string).unwrap_or(path))
}

/// Undo git's C-style quoting of a path (`core.quotePath`).
///
/// Unquoted input is returned as is. Octal escapes are UTF-8 bytes.
pub fn unquote_path(raw: &str) -> String {
    let Some(inner) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return raw.to_string();
    };
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some('a') => bytes.push(0x07),
            Some('b') => bytes.push(0x08),
            Some('f') => bytes.push(0x0c),
            Some('v') => bytes.push(0x0b),
            Some(d @ '0'..='7') => {
                let mut value = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some(other) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => bytes.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn parse_numstat(out: &str) -> Result<Vec<NumstatEntry>> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.splitn(3, '\t');
            let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(anyhow!("unexpected numstat line: '{line}'"));
            };
            Ok(NumstatEntry {
                path: unquote_path(path),
                added: parse_count(added, line)?,
                removed: parse_count(removed, line)?,
            })
        })
        .collect()
}

fn parse_count(field: &str, line: &str) -> Result<Option<u64>> {
    if field == "-" {
        return Ok(None);
    }
    field
        .parse::<u64>()
        .map(Some)
        .with_context(|| format!("unexpected numstat line: '{line}'"))
}

/// Parse `merge-tree --write-tree --name-only --no-messages` output.
pub fn parse_merge_tree(out: &str, clean: bool) -> Result<MergeTree> {
    let mut lines = out.lines();
    let tree = lines
        .next()
        .map(str::trim)
        .filter(|oid| !oid.is_empty())
        .ok_or_else(|| anyhow!("merge-tree printed no tree id"))?
        .to_string();
    let mut conflicted_files: Vec<String> = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        let path = unquote_path(line);
        if !conflicted_files.contains(&path) {
            conflicted_files.push(path);
        }
    }
    Ok(MergeTree {
        clean,
        tree,
        conflicted_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -3 +3 @@ fn a() {
-old
+new
@@ -10,0 +11,2 @@ fn b() {
+one
+two
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
index 3333333..0000000
--- a/gone.txt
+++ /dev/null
@@ -1,2 +0,0 @@
-x
-y
diff --git a/new.txt b/new.txt
new file mode 100644
index 0000000..4444444
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+hello
";

    #[test]
    fn parses_hunk_ranges_in_base_coordinates() {
        let files = parse_unified_zero(DIFF);

        assert_eq!(
            files["src/lib.rs"],
            Some(vec![LineRange { start: 3, end: 4 }, LineRange { start: 11, end: 11 }])
        );
        assert_eq!(files["gone.txt"], None);
        assert_eq!(files["new.txt"], Some(vec![LineRange { start: 1, end: 1 }]));
    }

    #[test]
    fn hunk_body_lines_that_look_like_headers_are_content() {
        let diff = "\
diff --git a/notes.md b/notes.md
index 1111111..2222222 100644
--- a/notes.md
+++ b/notes.md
@@ -4 +4 @@
--- a/other.md
+++ b/other.md
@@ -9,2 +9,0 @@
--- /dev/null
-++ gone
";
        let files = parse_unified_zero(diff);

        assert_eq!(files.len(), 1);
        assert_eq!(
            files["notes.md"],
            Some(vec![LineRange { start: 4, end: 5 }, LineRange { start: 9, end: 11 }])
        );
    }

    #[test]
    fn quoted_paths_are_unquoted_in_diffs_and_numstat() {
        let diff = "\
diff --git \"a/docs/caf\\303\\251 \\\"menu\\\".md\" \"b/docs/caf\\303\\251 \\\"menu\\\".md\"
index 1111111..2222222 100644
--- \"a/docs/caf\\303\\251 \\\"menu\\\".md\"
+++ \"b/docs/caf\\303\\251 \\\"menu\\\".md\"
@@ -2 +2 @@
-old
+new
";
        let files = parse_unified_zero(diff);
        assert_eq!(
            files["docs/café \"menu\".md"],
            Some(vec![LineRange { start: 2, end: 3 }])
        );

        let rows = parse_numstat("1\t1\t\"docs/caf\\303\\251 \\\"menu\\\".md\"\n").expect("parse");
        assert_eq!(rows[0].path, "docs/café \"menu\".md");
        assert_eq!(unquote_path("plain/path.rs"), "plain/path.rs");
    }

    #[test]
    fn parses_numstat_with_binary_rows() {
        let rows = parse_numstat("3\t1\tsrc/lib.rs\n-\t-\tlogo.png\n").expect("parse");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].added, Some(3));
        assert!(!rows[0].is_binary());
        assert!(rows[1].is_binary());
        assert_eq!(rows[1].path, "logo.png");

        assert!(parse_numstat("garbage\n").is_err());
    }

    #[test]
    fn parses_merge_tree_output() {
        let merged = parse_merge_tree("abc123\nsrc/lib.rs\nsrc/lib.rs\nREADME.md\n", false)
            .expect("parse");
        assert_eq!(merged.tree, "abc123");
        assert!(!merged.clean);
        assert_eq!(merged.conflicted_files, vec!["src/lib.rs", "README.md"]);

        let clean = parse_merge_tree("def456\n", true).expect("parse");
        assert!(clean.conflicted_files.is_empty());
        assert!(parse_merge_tree("", true).is_err());
    }
}
