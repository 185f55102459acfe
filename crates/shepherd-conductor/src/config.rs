use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration. Every field has a default, so an empty `{}` file
/// (or no file at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShepherdConfig {
    /// Seconds between CI polls for each watched pull request.
    pub poll_interval_secs: u64,
    /// Parent directory for cloned workspaces. Defaults to `store_root/workspaces`.
    pub workspaces_root: Option<PathBuf>,
    pub agent: AgentConfig,
    pub escalation: EscalationConfig,
    pub git: GitConfig,
    pub hosting: HostingConfig,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            workspaces_root: None,
            agent: AgentConfig::default(),
            escalation: EscalationConfig::default(),
            git: GitConfig::default(),
            hosting: HostingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bin: PathBuf,
    pub permission_mode: String,
    /// Appended verbatim after the generated arguments.
    pub extra_args: Vec<String>,
    pub overall_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub heartbeat_secs: u64,
    /// If set, raw agent stdout is captured under this directory.
    pub transcript_dir: Option<PathBuf>,
    /// Environment variables whose presence means we run inside a sandbox
    /// that hides the agent's credentials.
    pub sandbox_markers: Vec<String>,
    /// Launcher argv used to escape the sandbox, e.g. `["/usr/bin/env", "-u", "SANDBOX"]`.
    /// The agent command is appended to it.
    pub sandbox_escape: Option<Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("claude"),
            permission_mode: "acceptEdits".into(),
            extra_args: Vec::new(),
            overall_timeout_secs: 3600,
            inactivity_timeout_secs: 300,
            heartbeat_secs: 30,
            transcript_dir: None,
            sandbox_markers: vec!["SANDBOX_RUNTIME".into(), "CODEX_SANDBOX".into()],
            sandbox_escape: None,
        }
    }
}

impl AgentConfig {
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Hard ceiling of recorded attempts per check name.
    pub max_attempts_per_check: u32,
    /// Annotations included in the templated prompt.
    pub templated_annotation_limit: usize,
    /// CI integrations (GitHub app slugs) that expose job/step detail and logs.
    pub structured_apps: Vec<String>,
    /// User-supplied logs longer than this are cut to their tail.
    pub max_log_chars: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_check: 3,
            templated_annotation_limit: 5,
            structured_apps: vec!["github-actions".into()],
            max_log_chars: 20_000,
        }
    }
}

impl EscalationConfig {
    pub fn is_structured(&self, app: &str) -> bool {
        self.structured_apps.iter().any(|a| a == app)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub bin: PathBuf,
    pub remote: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("git"),
            remote: "origin".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    pub gh_bin: PathBuf,
    pub host: String,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            gh_bin: PathBuf::from("gh"),
            host: "github.com".into(),
        }
    }
}

impl ShepherdConfig {
    /// Load from an explicit path, or `store_root/config.json` when `None`.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(shepherd_store::config_path);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing config: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(bin) = std::env::var_os("SHEPHERD_AGENT_BIN").filter(|v| !v.is_empty()) {
            self.agent.bin = PathBuf::from(bin);
        }
        if let Some(dir) = std::env::var_os("SHEPHERD_WORKSPACES").filter(|v| !v.is_empty()) {
            self.workspaces_root = Some(PathBuf::from(dir));
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn workspaces_root(&self) -> PathBuf {
        self.workspaces_root
            .clone()
            .unwrap_or_else(shepherd_store::workspaces_dir)
    }
}
