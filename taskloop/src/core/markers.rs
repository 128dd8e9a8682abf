//! Structural markers in the agent's output stream.
//!
//! The agent reports per-task results with one marker per line:
//!
//! ```text
//! TASK_COMPLETE: 1.2
//! TASK_COMPLETE: 1.3 findings=notes/1.3.md
//! TASK_FAILED: 1.4: tests still failing
//! ```
//!
//! Leading list/quote decoration (`- `, `> `, `* `, backticks) is tolerated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s>*`-]*TASK_COMPLETE:\s*(?P<id>[^\s:`]+)(?:\s+findings=(?P<findings>\S+))?")
        .expect("valid complete marker regex")
});

static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s>*`-]*TASK_FAILED:\s*(?P<id>[^\s:`]+)\s*(?::\s*(?P<message>.*?))?\s*`?$")
        .expect("valid failed marker regex")
});

/// One marker found in the agent's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Completed {
        task_id: String,
        findings: Option<String>,
    },
    Failed {
        task_id: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn task_id(&self) -> &str {
        match self {
            AgentEvent::Completed { task_id, .. } | AgentEvent::Failed { task_id, .. } => task_id,
        }
    }
}

/// Parse one output line. Returns `None` for ordinary output.
pub fn parse_line(line: &str) -> Option<AgentEvent> {
    if let Some(caps) = COMPLETE_RE.captures(line) {
        return Some(AgentEvent::Completed {
            task_id: caps["id"].to_string(),
            findings: caps.name("findings").map(|m| m.as_str().to_string()),
        });
    }
    if let Some(caps) = FAILED_RE.captures(line) {
        let message = caps
            .name("message")
            .map(|m| m.as_str().trim())
            .filter(|m| !m.is_empty())
            .unwrap_or("agent reported failure without a message");
        return Some(AgentEvent::Failed {
            task_id: caps["id"].to_string(),
            message: message.to_string(),
        });
    }
    None
}

/// Per-task result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    Completed { findings: Option<String> },
    Failed { message: String },
}

/// How the agent process ended, for tasks it never reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Exited(Option<i32>),
    TimedOut { timeout_secs: u64 },
}

/// Fold markers into one result per batch task.
///
/// The last marker for a task wins. Markers for ids outside the batch are
/// returned separately so the caller can warn. Tasks without a marker fail
/// with a message describing how the agent ended.
pub fn resolve_results(
    batch: &[String],
    events: &[AgentEvent],
    exit: AgentExit,
) -> (BTreeMap<String, TaskResult>, Vec<String>) {
    let mut results: BTreeMap<String, TaskResult> = BTreeMap::new();
    let mut unexpected = Vec::new();
    for event in events {
        if !batch.iter().any(|id| id == event.task_id()) {
            unexpected.push(event.task_id().to_string());
            continue;
        }
        let result = match event {
            AgentEvent::Completed { findings, .. } => TaskResult::Completed {
                findings: findings.clone(),
            },
            AgentEvent::Failed { message, .. } => TaskResult::Failed {
                message: message.clone(),
            },
        };
        results.insert(event.task_id().to_string(), result);
    }

    let inferred = match exit {
        AgentExit::TimedOut { timeout_secs } => {
            format!("agent timed out after {timeout_secs}s without reporting this task")
        }
        AgentExit::Exited(Some(0)) => "agent exited without reporting this task".to_string(),
        AgentExit::Exited(Some(code)) => {
            format!("agent exited with code {code} without reporting this task")
        }
        AgentExit::Exited(None) => {
            "agent was terminated by a signal without reporting this task".to_string()
        }
    };
    for id in batch {
        results
            .entry(id.clone())
            .or_insert_with(|| TaskResult::Failed {
                message: inferred.clone(),
            });
    }
    (results, unexpected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_with_and_without_findings() {
        assert_eq!(
            parse_line("TASK_COMPLETE: 1.2"),
            Some(AgentEvent::Completed {
                task_id: "1.2".to_string(),
                findings: None,
            })
        );
        assert_eq!(
            parse_line("  - TASK_COMPLETE: 1.3 findings=notes/1.3.md"),
            Some(AgentEvent::Completed {
                task_id: "1.3".to_string(),
                findings: Some("notes/1.3.md".to_string()),
            })
        );
    }

    #[test]
    fn parses_failed_with_message() {
        assert_eq!(
            parse_line("TASK_FAILED: 2.1: cargo test still failing"),
            Some(AgentEvent::Failed {
                task_id: "2.1".to_string(),
                message: "cargo test still failing".to_string(),
            })
        );
        assert_eq!(
            parse_line("`TASK_FAILED: 2.1`"),
            Some(AgentEvent::Failed {
                task_id: "2.1".to_string(),
                message: "agent reported failure without a message".to_string(),
            })
        );
    }

    #[test]
    fn ignores_mentions_inside_prose() {
        assert_eq!(parse_line("I will print TASK_COMPLETE: 1.1 when done"), None);
        assert_eq!(parse_line("ordinary output"), None);
    }

    #[test]
    fn unreported_tasks_fail_and_last_marker_wins() {
        let batch = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let events = vec![
            parse_line("TASK_FAILED: 1: first try").expect("marker"),
            parse_line("TASK_COMPLETE: 1").expect("marker"),
            parse_line("TASK_COMPLETE: 9").expect("marker"),
            parse_line("TASK_FAILED: 2: nope").expect("marker"),
        ];
        let (results, unexpected) =
            resolve_results(&batch, &events, AgentExit::TimedOut { timeout_secs: 600 });

        assert_eq!(results["1"], TaskResult::Completed { findings: None });
        assert_eq!(
            results["2"],
            TaskResult::Failed {
                message: "nope".to_string()
            }
        );
        assert_eq!(
            results["3"],
            TaskResult::Failed {
                message: "agent timed out after 600s without reporting this task".to_string()
            }
        );
        assert_eq!(unexpected, vec!["9".to_string()]);
    }
}
