//! Atomic file replacement shared by every persisted artifact.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Write `contents` to `tmp_path`, fsync it, then rename it over `path`.
///
/// Readers see either the previous file or the new one, never a partial write.
pub fn write_atomic_via(path: &Path, tmp_path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    write_synced(tmp_path, contents)?;
    fs::rename(tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent)
}

/// Atomic write using `<path>.tmp` as the staging file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    write_atomic_via(path, Path::new(&tmp), contents)
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &to_json_bytes(value)?)
}

pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec_pretty(value).context("serialize json")?;
    buf.push(b'\n');
    Ok(buf)
}

/// Create or truncate `path`, write `contents` and flush them to disk.
pub fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", path.display()))
}

/// Flush directory entries (renames) to disk. No-op off Unix.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .with_context(|| format!("sync directory {}", dir.display()))
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");
        write_atomic(&path, b"one").expect("first write");
        write_atomic(&path, b"two").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert!(!temp.path().join("nested").join("state.json.tmp").exists());
    }
}
