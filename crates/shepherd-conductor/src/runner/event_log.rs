//! Structured event journal for watch sessions.
//!
//! Writes append-only JSONL to `<store_root>/sessions/<session_id>/events.jsonl`.
//! The journal is an audit trail only; sessions are never reloaded from it.

use crate::session::machine::FixMethod;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Event types ──

/// A session event. Serialized as tagged JSON (`"type": "fix_skipped"`, etc.).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    WatchStarted {
        pr: String,
        branch: String,
        head_sha: String,
        workspace: PathBuf,
    },
    HeadAdvanced {
        from: String,
        to: String,
    },
    CheckFailed {
        check: String,
        app: String,
    },
    FixStarted {
        check: String,
        attempt: u32,
        method: FixMethod,
    },
    FixCompleted {
        check: String,
        attempt: u32,
        method: FixMethod,
        success: bool,
        commit_sha: Option<String>,
    },
    FixSkipped {
        check: String,
        holder: PathBuf,
    },
    AgentTimedOut {
        check: String,
        attempt: u32,
        inactivity: bool,
    },
    PushRejected {
        check: String,
        error: String,
    },
    AwaitingUser {
        check: String,
        reason: String,
    },
    LogsProvided {
        check: String,
        chars: usize,
    },
    ChecksPassed {
        count: usize,
    },
    Squashed {
        new_sha: String,
        commits_removed: u32,
    },
    Error {
        message: String,
    },
    Stopped {
        reason: String,
    },
}

impl SessionEvent {
    /// One-line human-readable form, used for notifications and `last_event`.
    pub fn describe(&self) -> String {
        match self {
            Self::WatchStarted { pr, branch, head_sha, .. } => {
                format!("watching {pr} ({branch} @ {})", short_sha(head_sha))
            }
            Self::HeadAdvanced { from, to } => {
                format!("head moved {} -> {}", short_sha(from), short_sha(to))
            }
            Self::CheckFailed { check, app } => format!("check '{check}' failing ({app})"),
            Self::FixStarted { check, attempt, method } => {
                format!("fix attempt {attempt} for '{check}' ({method})")
            }
            Self::FixCompleted { check, attempt, success, commit_sha, .. } => {
                match (success, commit_sha) {
                    (true, Some(sha)) => {
                        format!("attempt {attempt} for '{check}' pushed {}", short_sha(sha))
                    }
                    (true, None) => format!("attempt {attempt} for '{check}' made no commit"),
                    (false, _) => format!("attempt {attempt} for '{check}' failed"),
                }
            }
            Self::FixSkipped { check, holder } => {
                format!("skipped fix for '{check}': agent busy in {}", holder.display())
            }
            Self::AgentTimedOut { check, attempt, inactivity } => {
                let kind = if *inactivity { "inactivity" } else { "overall" };
                format!("attempt {attempt} for '{check}' hit the {kind} timeout")
            }
            Self::PushRejected { check, error } => format!("push rejected for '{check}': {error}"),
            Self::AwaitingUser { check, reason } => format!("awaiting user for '{check}': {reason}"),
            Self::LogsProvided { check, chars } => format!("logs provided for '{check}' ({chars} chars)"),
            Self::ChecksPassed { count } => format!("all {count} checks passing"),
            Self::Squashed { new_sha, commits_removed } => {
                format!("squashed {commits_removed} commit(s) into {}", short_sha(new_sha))
            }
            Self::Error { message } => format!("error: {message}"),
            Self::Stopped { reason } => format!("stopped: {reason}"),
        }
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

/// Wrapper that adds sequence number and timestamp to each event.
#[derive(Debug, Serialize)]
pub struct FullEvent<'a> {
    pub seq: u32,
    pub ts: String,
    pub session: &'a str,
    #[serde(flatten)]
    pub event: &'a SessionEvent,
}

// ── EventLogger ──

/// Append-only JSONL event writer.
pub struct EventLogger {
    session_id: String,
    jsonl_path: Option<PathBuf>,
    seq: u32,
}

impl EventLogger {
    /// Journal under the store: `<store_root>/sessions/<session_id>/events.jsonl`.
    pub fn for_session(session_id: &str) -> Self {
        Self::at(
            session_id,
            shepherd_store::session_dir(session_id).join("events.jsonl"),
        )
    }

    pub fn at(session_id: &str, jsonl_path: PathBuf) -> Self {
        Self {
            session_id: session_id.to_string(),
            jsonl_path: Some(jsonl_path),
            seq: 0,
        }
    }

    /// Logger that only counts; nothing touches disk.
    pub fn disabled(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            jsonl_path: None,
            seq: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.jsonl_path.as_deref()
    }

    /// Record an event. Best-effort: silently ignores write failures.
    pub fn record(&mut self, event: &SessionEvent) {
        let full = FullEvent {
            seq: self.seq,
            ts: crate::now_rfc3339(),
            session: &self.session_id,
            event,
        };
        self.seq += 1;

        if let (Some(path), Ok(line)) = (&self.jsonl_path, serde_json::to_string(&full)) {
            let _ = append_line(path, &line);
        }
    }
}

/// Append a single line to a file, creating parent dirs if needed.
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
