use crate::hosting::{
    Annotation, CheckDetail, CheckEntry, CheckKind, CheckState, CheckSummary, HostingApi,
    HostingError, PrInfo, PrRef, RepoSlug,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// GitHub access through the `gh` CLI (`gh api ...`).
///
/// Authentication is whatever `gh` is configured with (`GH_TOKEN`,
/// `gh auth login`); prompts and update checks are disabled so the CLI never
/// blocks waiting for a terminal.
pub struct GhCli {
    gh_bin: PathBuf,
    host: String,
}

impl GhCli {
    pub fn new(gh_bin: PathBuf, host: impl Into<String>) -> Self {
        Self {
            gh_bin,
            host: host.into(),
        }
    }

    /// Check that the `gh` binary is reachable.
    pub async fn verify_available(&self) -> anyhow::Result<()> {
        let status = Command::new(&self.gh_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => Ok(()),
            _ => anyhow::bail!(
                "GitHub CLI not found (looked for {:?}).\n\
                 Install: https://cli.github.com",
                self.gh_bin
            ),
        }
    }

    async fn api<T: DeserializeOwned>(&self, path: &str) -> Result<T, HostingError> {
        let program = self.gh_bin.display().to_string();
        debug!(path, "gh api");
        let output = Command::new(&self.gh_bin)
            .arg("api")
            .arg("--hostname")
            .arg(&self.host)
            .arg("-H")
            .arg("Accept: application/vnd.github+json")
            .arg(path)
            .env("GH_NO_UPDATE_NOTIFIER", "1")
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HostingError::Spawn { program, source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("HTTP 404") {
                return Err(HostingError::NotFound(path.to_string()));
            }
            return Err(HostingError::Command {
                command: format!("gh api {path}"),
                stderr,
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|source| HostingError::Parse {
            what: path.to_string(),
            source,
        })
    }
}

#[async_trait::async_trait]
impl HostingApi for GhCli {
    async fn resolve_pr(&self, pr: &PrRef) -> Result<PrInfo, HostingError> {
        let path = format!(
            "repos/{}/{}/pulls/{}",
            pr.repo.owner, pr.repo.name, pr.number
        );
        let raw: RawPull = self.api(&path).await?;
        Ok(raw.into_info())
    }

    async fn check_results(
        &self,
        repo: &RepoSlug,
        sha: &str,
    ) -> Result<CheckSummary, HostingError> {
        let runs: RawCheckRuns = self
            .api(&format!(
                "repos/{}/{}/commits/{sha}/check-runs?per_page=100",
                repo.owner, repo.name
            ))
            .await?;
        let statuses: RawCombinedStatus = self
            .api(&format!(
                "repos/{}/{}/commits/{sha}/status?per_page=100",
                repo.owner, repo.name
            ))
            .await?;

        let mut checks: Vec<CheckEntry> =
            runs.check_runs.into_iter().map(RawCheckRun::into_entry).collect();
        checks.extend(statuses.statuses.into_iter().map(RawStatus::into_entry));
        Ok(CheckSummary { checks })
    }

    async fn check_run_detail(
        &self,
        repo: &RepoSlug,
        run_id: u64,
    ) -> Result<CheckDetail, HostingError> {
        let annotations: Vec<RawAnnotation> = self
            .api(&format!(
                "repos/{}/{}/check-runs/{run_id}/annotations?per_page=100",
                repo.owner, repo.name
            ))
            .await?;

        // For GitHub Actions the check run id doubles as the job id.
        let failed_steps = match self
            .api::<RawJob>(&format!(
                "repos/{}/{}/actions/jobs/{run_id}",
                repo.owner, repo.name
            ))
            .await
        {
            Ok(job) => job.failed_steps(),
            Err(e) => {
                warn!(run_id, error = %e, "could not fetch job steps");
                Vec::new()
            }
        };

        Ok(CheckDetail {
            annotations: annotations.into_iter().map(RawAnnotation::into_annotation).collect(),
            failed_steps,
        })
    }
}

// ── Raw GitHub REST shapes ──

#[derive(Debug, Deserialize)]
struct RawPull {
    head: RawPullRef,
    base: RawPullRef,
}

#[derive(Debug, Deserialize)]
struct RawPullRef {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    repo: Option<RawRepo>,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    clone_url: String,
}

impl RawPull {
    fn into_info(self) -> PrInfo {
        // Fork PRs push to the head repository; a deleted fork leaves `head.repo` null.
        let clone_url = self
            .head
            .repo
            .or(self.base.repo)
            .map(|r| r.clone_url)
            .unwrap_or_default();
        PrInfo {
            head_sha: self.head.sha,
            branch: self.head.ref_name,
            base_branch: self.base.ref_name,
            clone_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCheckRuns {
    #[serde(default)]
    check_runs: Vec<RawCheckRun>,
}

#[derive(Debug, Deserialize)]
struct RawCheckRun {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    details_url: Option<String>,
    #[serde(default)]
    app: Option<RawApp>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    slug: String,
}

impl RawCheckRun {
    fn into_entry(self) -> CheckEntry {
        let state = if self.status != "completed" {
            CheckState::Pending
        } else {
            match self.conclusion.as_deref() {
                Some("success") | Some("neutral") | Some("skipped") => CheckState::Passing,
                None => CheckState::Pending,
                Some(_) => CheckState::Failing,
            }
        };
        CheckEntry {
            name: self.name,
            kind: CheckKind::CheckRun,
            state,
            url: self.html_url.or(self.details_url).unwrap_or_default(),
            app: self.app.map(|a| a.slug).unwrap_or_else(|| "unknown".into()),
            run_id: Some(self.id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCombinedStatus {
    #[serde(default)]
    statuses: Vec<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    context: String,
    state: String,
    #[serde(default)]
    target_url: Option<String>,
}

impl RawStatus {
    fn into_entry(self) -> CheckEntry {
        let state = match self.state.as_str() {
            "success" => CheckState::Passing,
            "failure" | "error" => CheckState::Failing,
            _ => CheckState::Pending,
        };
        let app = legacy_app(&self.context);
        CheckEntry {
            name: self.context,
            kind: CheckKind::LegacyStatus,
            state,
            url: self.target_url.unwrap_or_default(),
            app,
            run_id: None,
        }
    }
}

/// Statuses carry no app slug; the context prefix (`ci/jenkins`, `buildkite/app`)
/// is the closest identifier.
fn legacy_app(context: &str) -> String {
    let first = context.split('/').next().unwrap_or(context).trim();
    let app = if first == "ci" || first == "continuous-integration" {
        context.split('/').nth(1).unwrap_or(first)
    } else {
        first
    };
    app.trim().to_lowercase()
}

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    path: String,
    #[serde(default)]
    start_line: Option<u32>,
    message: String,
}

impl RawAnnotation {
    fn into_annotation(self) -> Annotation {
        Annotation {
            path: self.path,
            line: self.start_line,
            message: self.message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
}

impl RawJob {
    fn failed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.conclusion.as_deref() == Some("failure"))
            .map(|s| {
                if self.name.is_empty() {
                    s.name.clone()
                } else {
                    format!("{} / {}", self.name, s.name)
                }
            })
            .collect()
    }
}
