//! Per-pull-request watch sessions.

pub mod driver;
pub mod machine;

pub use driver::{FixOutcome, SessionDeps, SessionDriver, TickOutcome};
pub use machine::{FixAttempt, FixMethod, SessionStatus, WatchSession};

use crate::git::GitError;
use crate::hosting::HostingError;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session is {status}; squash requires success")]
    NotSuccess { status: SessionStatus },
    #[error("session is {status}; it is not waiting for logs")]
    NotAwaitingLogs { status: SessionStatus },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Hosting(#[from] HostingError),
}

/// Status line for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub pr: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_failure: Option<String>,
    pub attempts_by_check: BTreeMap<String, u32>,
    pub fix_attempts: u32,
    pub skipped_attempts: u32,
    pub elapsed_secs: u64,
    pub current_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
}

impl SessionReport {
    pub fn from_session(s: &WatchSession) -> Self {
        Self {
            session_id: s.session_id.clone(),
            pr: s.pr.to_string(),
            status: s.status,
            current_failure: s.current_failure.as_ref().map(|f| f.check_name.clone()),
            attempts_by_check: s.attempts_by_check(),
            fix_attempts: s.fix_attempts,
            skipped_attempts: s.skipped_attempts,
            elapsed_secs: s.elapsed().as_secs(),
            current_sha: s.current_sha.clone(),
            awaiting_reason: s.awaiting_reason.clone(),
            last_event: s.last_event.clone(),
        }
    }
}

/// What `stop` did to one session.
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub session_id: String,
    pub pr: String,
    pub previous_status: SessionStatus,
    pub fix_attempts: u32,
    pub skipped_attempts: u32,
    /// The session held the agent slot and its process was terminated.
    pub killed_agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SquashOutcome {
    pub new_sha: String,
    pub commits_removed: u32,
}
