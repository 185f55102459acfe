//! Source-hosting collaborator: resolve pull requests and read CI results.

pub mod github;
pub mod mock;
pub mod pr_ref;

pub use pr_ref::{PrRef, PrRefError, RepoSlug};

use serde::{Deserialize, Serialize};

/// Head and branch information for a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub head_sha: String,
    pub branch: String,
    pub base_branch: String,
    pub clone_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Checks API run (GitHub Actions, most modern integrations).
    CheckRun,
    /// Commit status API (older CI integrations).
    LegacyStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Passing,
    Failing,
    Pending,
}

/// One named CI job or status reported against a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub name: String,
    pub kind: CheckKind,
    pub state: CheckState,
    pub url: String,
    /// Originating CI integration, e.g. `github-actions`.
    pub app: String,
    /// Check run id, used to fetch annotations and steps. `None` for legacy statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
}

/// Combined CI results for one commit, check runs first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub checks: Vec<CheckEntry>,
}

impl CheckSummary {
    pub fn pending_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.state == CheckState::Pending)
            .count()
    }

    /// At least one check reported and every check passed.
    pub fn all_passing(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.state == CheckState::Passing)
    }
}

/// A file/line/message triple attached to a check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

/// Job/step detail for a check run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDetail {
    pub annotations: Vec<Annotation>,
    pub failed_steps: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("unexpected response for {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
}

/// Narrow interface onto the source-hosting service.
#[async_trait::async_trait]
pub trait HostingApi: Send + Sync {
    async fn resolve_pr(&self, pr: &PrRef) -> Result<PrInfo, HostingError>;

    async fn check_results(&self, repo: &RepoSlug, sha: &str)
        -> Result<CheckSummary, HostingError>;

    async fn check_run_detail(
        &self,
        repo: &RepoSlug,
        run_id: u64,
    ) -> Result<CheckDetail, HostingError>;
}
