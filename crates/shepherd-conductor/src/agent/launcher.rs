use crate::config::AgentConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Environment markers that stop the agent CLI from running nested inside
/// another agent session.
const NESTING_MARKERS: &[&str] = &["CLAUDE_CODE", "CLAUDECODE"];

/// Builds the agent command line.
#[derive(Debug, Clone)]
pub struct AgentCli {
    pub bin: PathBuf,
    pub permission_mode: String,
    pub extra_args: Vec<String>,
    pub sandbox_markers: Vec<String>,
    pub sandbox_escape: Option<Vec<String>>,
}

/// Resolved program, argv and environment edits for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env_remove: Vec<String>,
}

impl AgentCli {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            bin: config.bin.clone(),
            permission_mode: config.permission_mode.clone(),
            extra_args: config.extra_args.clone(),
            sandbox_markers: config.sandbox_markers.clone(),
            sandbox_escape: config.sandbox_escape.clone(),
        }
    }

    /// Agent arguments, excluding the program itself.
    pub fn agent_args(&self, prompt: &str, resume: Option<&str>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-p".into(),
            prompt.into(),
            "--verbose".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--permission-mode".into(),
            self.permission_mode.clone().into(),
        ];
        if let Some(token) = resume {
            args.push("--resume".into());
            args.push(token.into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// Whether any configured sandbox marker is present according to `has_var`.
    pub fn sandboxed(&self, has_var: impl Fn(&str) -> bool) -> bool {
        self.sandbox_markers.iter().any(|m| has_var(m))
    }

    pub fn plan(&self, prompt: &str, resume: Option<&str>, sandboxed: bool) -> LaunchPlan {
        let mut env_remove: Vec<String> = NESTING_MARKERS.iter().map(|s| s.to_string()).collect();
        let agent_args = self.agent_args(prompt, resume);

        if !sandboxed {
            return LaunchPlan {
                program: self.bin.clone(),
                args: agent_args,
                env_remove,
            };
        }

        env_remove.extend(self.sandbox_markers.iter().cloned());
        match self.sandbox_escape.as_deref() {
            Some([wrapper, wrapper_args @ ..]) => {
                let mut args: Vec<OsString> = wrapper_args.iter().map(OsString::from).collect();
                args.push(self.bin.clone().into_os_string());
                args.extend(agent_args);
                LaunchPlan {
                    program: PathBuf::from(wrapper),
                    args,
                    env_remove,
                }
            }
            _ => LaunchPlan {
                program: self.bin.clone(),
                args: agent_args,
                env_remove,
            },
        }
    }

    /// Command ready to spawn in `cwd`. All three stdio streams are piped;
    /// the caller keeps stdin open for the life of the child.
    pub fn command(&self, prompt: &str, resume: Option<&str>, cwd: &Path) -> tokio::process::Command {
        let sandboxed = self.sandboxed(|k| std::env::var_os(k).is_some());
        let plan = self.plan(prompt, resume, sandboxed);
        if sandboxed {
            tracing::info!(program = %plan.program.display(), "sandbox detected, launching agent through escape wrapper");
        }

        let mut cmd = tokio::process::Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &plan.env_remove {
            cmd.env_remove(key);
        }
        cmd
    }

    /// Check that the agent binary is reachable.
    pub async fn verify_available(&self) -> anyhow::Result<()> {
        let status = tokio::process::Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => Ok(()),
            _ => anyhow::bail!(
                "coding agent CLI not found (looked for {:?}).\n\
                 Install: npm install -g @anthropic-ai/claude-code",
                self.bin
            ),
        }
    }
}
