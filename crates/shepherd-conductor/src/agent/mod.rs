//! Supervision of the single external coding-agent process.

pub mod controller;
pub mod launcher;
pub mod mock;
pub mod stream;

pub use controller::{AgentController, AgentLimits};
pub use launcher::AgentCli;
pub use mock::MockAgent;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of one agent invocation that ran to exit.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRun {
    /// `exit_code == 0`.
    pub success: bool,
    /// Final result text, or accumulated output when no result was reported.
    pub output: String,
    pub continuation_token: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Snapshot of the agent slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStatus {
    /// Workspace of the live or most recent session.
    pub workspace: Option<PathBuf>,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub elapsed: Option<Duration>,
    pub idle: Option<Duration>,
    pub has_continuation: bool,
    /// Bytes of output seen so far from the live process.
    pub output_bytes: u64,
    /// Length of the accumulated output of the last finished run.
    pub log_len: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent slot is busy with {}", holder.display())]
    SlotBusy { holder: PathBuf },
    #[error("agent is already running in {}", workspace.display())]
    AlreadyRunning { workspace: PathBuf },
    #[error("no agent session to continue for {}", workspace.display())]
    NoContinuation { workspace: PathBuf },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent exceeded the overall timeout of {after:?}")]
    TimedOut { after: Duration },
    #[error("agent produced no output for {idle:?}")]
    Inactive { idle: Duration },
    #[error("agent exited with code {code:?} and no output: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("agent run was cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The coding-agent seam used by the session driver.
#[async_trait::async_trait]
pub trait CodingAgent: Send + Sync {
    /// Run a prompt in `workspace`, resuming the stored session for that
    /// workspace when one exists.
    async fn start(&self, prompt: &str, workspace: &Path) -> Result<AgentRun, AgentError>;

    /// Run a prompt in the existing session for `workspace`.
    async fn continue_session(&self, prompt: &str, workspace: &Path)
        -> Result<AgentRun, AgentError>;

    fn status(&self) -> AgentStatus;

    fn can_continue(&self, workspace: &Path) -> bool;

    /// Workspace of a live process that is not `workspace`.
    fn occupied_by_other(&self, workspace: &Path) -> Option<PathBuf>;

    /// Forget the finished session. A live process is left alone.
    fn end(&self) -> bool;

    /// Kill the live process, if any, and clear the slot.
    fn force_cleanup(&self) -> bool;

    /// Whether a live process belongs to `workspace`.
    fn holds_slot(&self, workspace: &Path) -> bool {
        let status = self.status();
        status.running && status.workspace.as_deref() == Some(workspace)
    }
}
