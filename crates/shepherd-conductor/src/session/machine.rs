use crate::failure::FailureInfo;
use crate::hosting::{PrRef, RepoSlug};
use crate::session::SessionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

// ── Status enums ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Watching,
    Fixing,
    AwaitingUser,
    Success,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Watching => "watching",
            Self::Fixing => "fixing",
            Self::AwaitingUser => "awaiting_user",
            Self::Success => "success",
            Self::Stopped => "stopped",
        })
    }
}

/// How a fix attempt was driven.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FixMethod {
    Templated,
    DeepAnalysis,
    /// Run on logs the user supplied after the session stopped for them.
    Manual,
}

impl fmt::Display for FixMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Templated => "templated",
            Self::DeepAnalysis => "deep_analysis",
            Self::Manual => "manual",
        })
    }
}

// ── State types ──

/// One executed fix attempt. Skipped attempts never produce one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixAttempt {
    pub timestamp: String,
    pub failure: FailureInfo,
    /// 1-based, per `failure.check_name`.
    pub attempt_number: u32,
    pub method: FixMethod,
    pub agent_response: String,
    /// New head produced by the attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub success: bool,
}

/// One pull request under watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSession {
    pub session_id: String,
    pub pr: PrRef,
    pub repo: RepoSlug,
    pub clone_url: String,
    pub pr_number: u64,
    pub branch: String,
    pub base_branch: String,
    pub workspace: PathBuf,

    pub status: SessionStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled: Option<String>,

    /// PR head when the watch began; the squash base.
    pub initial_commit_sha: String,
    /// Most recently observed head. Only moves forward, except by squash.
    pub current_sha: String,

    /// Executed attempts; always `fix_history.len()`.
    pub fix_attempts: u32,
    /// Attempts deferred because the agent was busy elsewhere.
    pub skipped_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_failure: Option<FailureInfo>,
    pub fix_history: Vec<FixAttempt>,

    /// One attempt past the ceiling, granted by supplied logs.
    #[serde(default)]
    pub logs_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,

    #[serde(skip)]
    started: Option<Instant>,
}

impl WatchSession {
    pub fn new(
        session_id: String,
        pr: PrRef,
        clone_url: String,
        branch: String,
        base_branch: String,
        workspace: PathBuf,
        head_sha: String,
    ) -> Self {
        Self {
            session_id,
            repo: pr.repo.clone(),
            pr_number: pr.number,
            pr,
            clone_url,
            branch,
            base_branch,
            workspace,
            status: SessionStatus::Watching,
            started_at: crate::now_rfc3339(),
            last_polled: None,
            initial_commit_sha: head_sha.clone(),
            current_sha: head_sha,
            fix_attempts: 0,
            skipped_attempts: 0,
            current_failure: None,
            fix_history: Vec::new(),
            logs_override: false,
            awaiting_reason: None,
            last_event: None,
            started: Some(Instant::now()),
        }
    }

    /// Recorded attempts for one check.
    pub fn attempts_for(&self, check_name: &str) -> u32 {
        self.fix_history
            .iter()
            .filter(|a| a.failure.check_name == check_name)
            .count() as u32
    }

    pub fn attempts_by_check(&self) -> BTreeMap<String, u32> {
        let mut map = BTreeMap::new();
        for a in &self.fix_history {
            *map.entry(a.failure.check_name.clone()).or_insert(0) += 1;
        }
        map
    }

    pub fn record_attempt(&mut self, attempt: FixAttempt) {
        self.fix_history.push(attempt);
        self.fix_attempts = self.fix_history.len() as u32;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(SessionStatus, &[SessionStatus])] = &[
    (
        SessionStatus::Watching,
        &[
            SessionStatus::Fixing,
            SessionStatus::Success,
            SessionStatus::Stopped,
        ],
    ),
    (
        SessionStatus::Fixing,
        &[
            SessionStatus::Watching,
            SessionStatus::AwaitingUser,
            SessionStatus::Stopped,
        ],
    ),
    (
        SessionStatus::AwaitingUser,
        &[SessionStatus::Fixing, SessionStatus::Stopped],
    ),
    (SessionStatus::Success, &[SessionStatus::Stopped]),
    // Stopped is terminal
];

pub fn is_valid_transition(from: SessionStatus, to: SessionStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── CAS-guarded transition ──

/// Move `session` from `from` to `to`.
/// Returns Ok(true) on success, Ok(false) on CAS miss (current != from).
pub fn transition(
    session: &mut WatchSession,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<bool, SessionError> {
    if session.status != from {
        return Ok(false);
    }
    if !is_valid_transition(from, to) {
        return Err(SessionError::InvalidTransition { from, to });
    }
    session.status = to;
    if to != SessionStatus::AwaitingUser {
        session.awaiting_reason = None;
    }
    Ok(true)
}

/// Stop from whatever state the session is in. Returns the previous status.
pub fn stop(session: &mut WatchSession) -> SessionStatus {
    let before = session.status;
    session.status = SessionStatus::Stopped;
    before
}
