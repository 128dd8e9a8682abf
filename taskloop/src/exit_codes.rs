//! Stable exit codes for taskloop CLI commands.

use crate::errors::{as_duplicate, is_lock_timeout};

/// Command succeeded. Loop stops (complete, blocked, cancelled, capped) are
/// reported in the JSON body, not the exit code.
pub const OK: i32 = 0;
/// Unrecoverable error: bad config, missing workflow, invalid transition.
pub const ERROR: i32 = 1;
/// The status or registry lock stayed busy; the caller may retry.
pub const LOCK_TIMEOUT: i32 = 2;
/// Another live orchestrator already owns the workflow.
pub const DUPLICATE: i32 = 3;

/// Exit code for a failed command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if is_lock_timeout(err) {
        LOCK_TIMEOUT
    } else if as_duplicate(err).is_some() {
        DUPLICATE
    } else {
        ERROR
    }
}
