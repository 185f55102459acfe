//! Workspace provisioning and history operations, by shelling out to `git`.

use crate::config::ShepherdConfig;
use crate::hosting::RepoSlug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("`git {args}` failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
    #[error("unexpected git output for `{args}`: {output}")]
    Parse { args: String, output: String },
    #[error("no commits to squash since {base}")]
    NothingToSquash { base: String },
    #[error("could not create {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a workspace directory is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceKey<'a> {
    Pr(u64),
    Branch(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashResult {
    pub new_sha: String,
    pub commits_removed: u32,
}

pub struct GitOps {
    bin: PathBuf,
    remote: String,
    workspaces_root: PathBuf,
}

impl GitOps {
    pub fn new(bin: PathBuf, remote: impl Into<String>, workspaces_root: PathBuf) -> Self {
        Self {
            bin,
            remote: remote.into(),
            workspaces_root,
        }
    }

    pub fn from_config(config: &ShepherdConfig) -> Self {
        Self::new(
            config.git.bin.clone(),
            config.git.remote.clone(),
            config.workspaces_root(),
        )
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn command(&self, cwd: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run git and return trimmed stdout.
    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!(cwd = %cwd.display(), args = %args.join(" "), "git");
        let output = self
            .command(cwd, args)
            .output()
            .await
            .map_err(GitError::Spawn)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git for its exit status only.
    async fn git_succeeds(&self, cwd: &Path, args: &[&str]) -> Result<bool, GitError> {
        let status = self
            .command(cwd, args)
            .status()
            .await
            .map_err(GitError::Spawn)?;
        Ok(status.success())
    }

    /// `<root>/<owner>-<repo>-pr-<n>`, or `<root>/<owner>-<repo>-<branch>`.
    pub fn workspace_path(&self, repo: &RepoSlug, key: WorkspaceKey<'_>) -> PathBuf {
        let name = match key {
            WorkspaceKey::Pr(n) => format!("{}-{}-pr-{n}", repo.owner, repo.name),
            WorkspaceKey::Branch(b) => format!("{}-{}-{b}", repo.owner, repo.name),
        };
        self.workspaces_root
            .join(shepherd_store::sanitize_component(&name))
    }

    /// Clone once, then only fetch and check out. Safe to call repeatedly.
    pub async fn provision_workspace(
        &self,
        clone_url: &str,
        repo: &RepoSlug,
        pr_number: Option<u64>,
        branch: &str,
    ) -> Result<PathBuf, GitError> {
        let key = pr_number.map_or(WorkspaceKey::Branch(branch), WorkspaceKey::Pr);
        let path = self.workspace_path(repo, key);

        if path.join(".git").exists() {
            debug!(workspace = %path.display(), "reusing workspace");
        } else {
            std::fs::create_dir_all(&self.workspaces_root).map_err(|source| GitError::Io {
                path: self.workspaces_root.clone(),
                source,
            })?;
            let target = path.to_string_lossy().into_owned();
            info!(url = clone_url, workspace = %target, "cloning");
            self.git(
                &self.workspaces_root,
                &["clone", "--origin", &self.remote, clone_url, &target],
            )
            .await?;
        }

        self.checkout_branch(&path, branch).await?;
        Ok(path)
    }

    /// Fetch, check out (creating a tracking branch when only the remote has
    /// it, or a plain branch when neither has it), then fast-forward.
    pub async fn checkout_branch(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        self.fetch(path).await?;

        let remote_ref = format!("refs/remotes/{}/{branch}", self.remote);
        let local_ref = format!("refs/heads/{branch}");
        let remote_exists = self
            .git_succeeds(path, &["rev-parse", "--verify", "--quiet", &remote_ref])
            .await?;
        let local_exists = self
            .git_succeeds(path, &["rev-parse", "--verify", "--quiet", &local_ref])
            .await?;

        if local_exists {
            self.git(path, &["checkout", branch]).await?;
        } else if remote_exists {
            let upstream = format!("{}/{branch}", self.remote);
            self.git(path, &["checkout", "-b", branch, "--track", &upstream])
                .await?;
        } else {
            self.git(path, &["checkout", "-b", branch]).await?;
        }

        if remote_exists {
            self.git(path, &["pull", "--ff-only", &self.remote, branch])
                .await?;
        }
        Ok(())
    }

    pub async fn fetch(&self, path: &Path) -> Result<(), GitError> {
        self.git(path, &["fetch", "--prune", &self.remote]).await?;
        Ok(())
    }

    /// Resynchronise when something else moved the clone. Returns whether it had to.
    pub async fn ensure_on_branch(&self, path: &Path, branch: &str) -> Result<bool, GitError> {
        let current = self.current_branch(path).await?;
        if current == branch {
            return Ok(false);
        }
        info!(workspace = %path.display(), from = %current, to = branch, "workspace moved, resyncing");
        self.checkout_branch(path, branch).await?;
        Ok(true)
    }

    pub async fn head_sha(&self, path: &Path) -> Result<String, GitError> {
        self.git(path, &["rev-parse", "HEAD"]).await
    }

    pub async fn current_branch(&self, path: &Path) -> Result<String, GitError> {
        self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(
        &self,
        path: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, GitError> {
        self.git_succeeds(path, &["merge-base", "--is-ancestor", ancestor, descendant])
            .await
    }

    /// Number of commits in `base..HEAD`.
    pub async fn commit_count_since(&self, path: &Path, base: &str) -> Result<u32, GitError> {
        let range = format!("{base}..HEAD");
        let args = ["rev-list", "--count", range.as_str()];
        let out = self.git(path, &args).await?;
        out.parse().map_err(|_| GitError::Parse {
            args: args.join(" "),
            output: out,
        })
    }

    pub async fn push(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.git(path, &["push", &self.remote, &refspec]).await?;
        Ok(())
    }

    pub async fn force_push(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let lease = format!("--force-with-lease=refs/heads/{branch}");
        self.git(path, &["push", &lease, &self.remote, &refspec])
            .await?;
        Ok(())
    }

    /// Collapse `base..HEAD` into one commit and force-push it.
    /// A failed commit or push is returned as-is, never retried, and the
    /// clone is put back on its pre-squash head to match the remote.
    pub async fn squash(
        &self,
        path: &Path,
        base: &str,
        message: &str,
        branch: &str,
    ) -> Result<SquashResult, GitError> {
        let count = self.commit_count_since(path, base).await?;
        if count == 0 {
            return Err(GitError::NothingToSquash {
                base: base.to_string(),
            });
        }

        let original = self.head_sha(path).await?;
        self.git(path, &["reset", "--soft", base]).await?;
        let landed = match self.git(path, &["commit", "--no-verify", "-m", message]).await {
            Ok(_) => self.force_push(path, branch).await,
            Err(e) => Err(e),
        };
        if let Err(e) = landed {
            if let Err(restore) = self.git(path, &["reset", "--soft", &original]).await {
                warn!(workspace = %path.display(), %original, error = %restore, "could not restore head after failed squash");
            }
            return Err(e);
        }

        let new_sha = self.head_sha(path).await?;
        info!(workspace = %path.display(), %new_sha, squashed = count, "squashed");
        Ok(SquashResult {
            new_sha,
            commits_removed: count - 1,
        })
    }

    /// Check that the git binary is reachable.
    pub async fn verify_available(&self) -> anyhow::Result<()> {
        let status = Command::new(&self.bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => Ok(()),
            _ => anyhow::bail!("git not found (looked for {:?})", self.bin),
        }
    }
}
