//! Advisory file locks.
//!
//! The lock file is persistent and locked with an OS advisory lock
//! (`fs2::FileExt::try_lock_exclusive`). The OS drops the lock when the
//! holding process exits, so a crashed holder never leaves the lock behind.
//! The file body records the current holder's pid and acquisition time for
//! diagnostics only; it never decides who holds the lock.
//!
//! The file is never removed: unlinking a lock file lets a waiter that
//! already opened the old inode and a newcomer creating a fresh one both
//! succeed.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::LockTimeoutError;

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long `acquire` waits before giving up with `LockTimeoutError`.
    pub timeout: Duration,
    /// A holder older than this is reported as suspect while waiting.
    pub stale_after: Duration,
}

impl LockOptions {
    pub fn from_millis(timeout_ms: u64, stale_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            stale_after: Duration::from_millis(stale_ms),
        }
    }
}

/// Holder record written into the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockStamp {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
    released: bool,
}

impl FileLock {
    /// Acquire the lock at `path`, waiting up to `opts.timeout`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn acquire(path: &Path, opts: LockOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock {}", path.display()))?;

        let started = Instant::now();
        let mut reported_suspect = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(e).with_context(|| format!("lock {}", path.display())),
            }
            if !reported_suspect
                && let Some(stamp) = read_stamp(&mut file)
                && held_for(&stamp) > opts.stale_after
            {
                reported_suspect = true;
                warn!(
                    holder_pid = stamp.pid,
                    held_ms = held_for(&stamp).as_millis() as u64,
                    "lock held past stale threshold"
                );
            }
            let waited = started.elapsed();
            if waited >= opts.timeout {
                return Err(LockTimeoutError {
                    path: path.to_path_buf(),
                    waited_ms: waited.as_millis() as u64,
                }
                .into());
            }
            thread::sleep(RETRY_INTERVAL.min(opts.timeout - waited));
        }

        if let Err(e) = write_stamp(&mut file) {
            warn!(err = %e, "failed to record lock holder");
        }
        debug!(waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing unlock errors.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        FileExt::unlock(&self.file).with_context(|| format!("unlock {}", self.path.display()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = FileExt::unlock(&self.file)
        {
            warn!(path = %self.path.display(), err = %e, "failed to release lock");
        }
    }
}

fn write_stamp(file: &mut File) -> Result<()> {
    let stamp = LockStamp {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let body = serde_json::to_vec(&stamp).context("serialize lock stamp")?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&body)?;
    file.flush()?;
    Ok(())
}

fn read_stamp(file: &mut File) -> Option<LockStamp> {
    let mut raw = Vec::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_end(&mut raw).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn held_for(stamp: &LockStamp) -> Duration {
    (Utc::now() - stamp.acquired_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opts(timeout_ms: u64, stale_ms: u64) -> LockOptions {
        LockOptions::from_millis(timeout_ms, stale_ms)
    }

    fn stamp_on_disk(path: &Path) -> Option<LockStamp> {
        serde_json::from_slice(&fs::read(path).ok()?).ok()
    }

    #[test]
    fn second_acquire_times_out_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.lock");

        let held = FileLock::acquire(&path, opts(1_000, 60_000)).expect("first");
        let err = FileLock::acquire(&path, opts(50, 60_000)).expect_err("contended");
        let timeout = err.downcast_ref::<LockTimeoutError>().expect("lock timeout");
        assert!(timeout.waited_ms >= 50);

        held.release().expect("release");
        let _again = FileLock::acquire(&path, opts(50, 60_000)).expect("after release");
    }

    #[test]
    fn drop_releases_lock_and_keeps_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.lock");
        {
            let _lock = FileLock::acquire(&path, opts(50, 60_000)).expect("acquire");
            assert_eq!(stamp_on_disk(&path).map(|s| s.pid), Some(std::process::id()));
        }
        assert!(path.exists());
        let _again = FileLock::acquire(&path, opts(50, 60_000)).expect("after drop");
    }

    #[test]
    fn leftover_stamp_of_dead_process_does_not_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.lock");
        let mut child = Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");
        let stamp = LockStamp {
            pid: dead_pid,
            acquired_at: Utc::now() - chrono::Duration::hours(1),
        };
        fs::write(&path, serde_json::to_vec(&stamp).expect("json")).expect("write stamp");

        let lock = FileLock::acquire(&path, opts(200, 10)).expect("acquire");
        assert_eq!(stamp_on_disk(lock.path()).map(|s| s.pid), Some(std::process::id()));
    }

    #[test]
    fn contenders_on_a_dead_holders_lock_never_overlap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.lock");
        let stamp = LockStamp {
            pid: 0,
            acquired_at: Utc::now() - chrono::Duration::hours(1),
        };
        fs::write(&path, serde_json::to_vec(&stamp).expect("json")).expect("write stamp");

        let holders = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let holders = Arc::clone(&holders);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    let lock = FileLock::acquire(&path, opts(10_000, 1)).expect("acquire");
                    if holders.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    lock.release().expect("release");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
