use crate::agent::stream::{Activity, StreamMonitor};
use crate::agent::{AgentCli, AgentError, AgentRun, AgentStatus, CodingAgent};
use crate::config::AgentConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL: usize = 4096;
/// How long to wait for stderr to close once the agent has exited.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Time limits for one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentLimits {
    pub overall: Duration,
    /// Measured from the last byte of stdout.
    pub inactivity: Duration,
    /// Interval for the observability tick that also performs the inactivity check.
    pub heartbeat: Duration,
}

impl AgentLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            overall: config.overall_timeout(),
            inactivity: config.inactivity_timeout(),
            heartbeat: config.heartbeat(),
        }
    }
}

/// The slot's occupant.
struct AgentProcessHandle {
    generation: u64,
    workspace: PathBuf,
    continuation_token: Option<String>,
    pid: Option<u32>,
    running: bool,
    started_at: Instant,
    started_at_rfc: String,
    activity: Arc<Activity>,
    cancel: CancellationToken,
    log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Start,
    Continue,
}

struct Claim {
    generation: u64,
    resume: Option<String>,
    activity: Arc<Activity>,
    cancel: CancellationToken,
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    ReadFailed(std::io::Error),
    Inactive(Duration),
    Overall,
    Cancelled,
}

/// Owns the single agent slot and supervises the process occupying it.
pub struct AgentController {
    cli: AgentCli,
    limits: AgentLimits,
    transcript_dir: Option<PathBuf>,
    slot: Mutex<Option<AgentProcessHandle>>,
    next_generation: AtomicU64,
}

impl AgentController {
    pub fn new(cli: AgentCli, limits: AgentLimits) -> Self {
        Self {
            cli,
            limits,
            transcript_dir: None,
            slot: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(AgentCli::from_config(config), AgentLimits::from_config(config))
            .with_transcripts(config.transcript_dir.clone())
    }

    /// If set, raw agent stdout is captured under `dir`.
    pub fn with_transcripts(mut self, dir: Option<PathBuf>) -> Self {
        self.transcript_dir = dir;
        self
    }

    pub fn cli(&self) -> &AgentCli {
        &self.cli
    }

    fn lock(&self) -> MutexGuard<'_, Option<AgentProcessHandle>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Occupancy check and slot claim, under one lock.
    fn claim(&self, workspace: &Path, mode: Mode) -> Result<Claim, AgentError> {
        let mut slot = self.lock();
        if let Some(h) = slot.as_ref().filter(|h| h.running) {
            if h.workspace != workspace {
                return Err(AgentError::SlotBusy {
                    holder: h.workspace.clone(),
                });
            }
            return Err(AgentError::AlreadyRunning {
                workspace: h.workspace.clone(),
            });
        }

        let resume = slot
            .as_ref()
            .filter(|h| h.workspace == workspace)
            .and_then(|h| h.continuation_token.clone());
        if mode == Mode::Continue && resume.is_none() {
            return Err(AgentError::NoContinuation {
                workspace: workspace.to_path_buf(),
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let activity = Arc::new(Activity::new());
        let cancel = CancellationToken::new();
        *slot = Some(AgentProcessHandle {
            generation,
            workspace: workspace.to_path_buf(),
            continuation_token: resume.clone(),
            pid: None,
            running: true,
            started_at: Instant::now(),
            started_at_rfc: crate::now_rfc3339(),
            activity: Arc::clone(&activity),
            cancel: cancel.clone(),
            log: String::new(),
        });
        Ok(Claim {
            generation,
            resume,
            activity,
            cancel,
        })
    }

    /// Apply `f` to the slot if it still belongs to `generation`.
    fn update(&self, generation: u64, f: impl FnOnce(&mut AgentProcessHandle)) {
        if let Some(h) = self.lock().as_mut().filter(|h| h.generation == generation) {
            f(h);
        }
    }

    fn transcript_path(&self, workspace: &Path) -> Option<PathBuf> {
        self.transcript_dir.as_ref().map(|dir| {
            let name = workspace
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".into());
            let ts = time::OffsetDateTime::now_utc().unix_timestamp();
            dir.join(format!("{}-{ts}.jsonl", shepherd_store::sanitize_component(&name)))
        })
    }

    async fn run(&self, prompt: &str, workspace: &Path, mode: Mode) -> Result<AgentRun, AgentError> {
        let claim = self.claim(workspace, mode)?;
        let generation = claim.generation;
        let started = Instant::now();
        info!(
            workspace = %workspace.display(),
            resume = claim.resume.is_some(),
            "starting coding agent"
        );

        let mut child = match self
            .cli
            .command(prompt, claim.resume.as_deref(), workspace)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.update(generation, |h| h.running = false);
                return Err(AgentError::Spawn {
                    program: self.cli.bin.display().to_string(),
                    source,
                });
            }
        };
        let pid = child.id();
        self.update(generation, |h| h.pid = pid);

        // Held open until the child is gone; some agent CLIs stall on a closed stdin.
        let _stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            self.update(generation, |h| h.running = false);
            return Err(AgentError::Io(std::io::Error::other("agent stdout not captured")));
        };
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                tail(&String::from_utf8_lossy(&buf), STDERR_TAIL)
            })
        });

        let mut monitor = StreamMonitor::new(stdout, Arc::clone(&claim.activity))
            .with_tee(self.transcript_path(workspace));

        let ending = {
            let read = monitor.run();
            tokio::pin!(read);
            let deadline = tokio::time::sleep(self.limits.overall);
            tokio::pin!(deadline);
            let mut heartbeat = tokio::time::interval(self.limits.heartbeat);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;

            let mut stdout_closed = false;
            loop {
                tokio::select! {
                    res = &mut read, if !stdout_closed => match res {
                        Ok(()) => stdout_closed = true,
                        Err(e) => break Ending::ReadFailed(e),
                    },
                    status = child.wait(), if stdout_closed => break Ending::Exited(status),
                    _ = heartbeat.tick() => {
                        let idle = claim.activity.idle();
                        debug!(
                            elapsed_secs = started.elapsed().as_secs(),
                            idle_secs = idle.as_secs(),
                            "agent heartbeat"
                        );
                        if idle >= self.limits.inactivity {
                            break Ending::Inactive(idle);
                        }
                    }
                    _ = &mut deadline => break Ending::Overall,
                    _ = claim.cancel.cancelled() => break Ending::Cancelled,
                }
            }
        };
        let outcome = monitor.into_outcome();
        let token = outcome.session_id.clone().or_else(|| claim.resume.clone());

        let finished = match ending {
            Ending::Exited(status) => status.map_err(AgentError::Io),
            Ending::ReadFailed(e) => Err(AgentError::Io(e)),
            Ending::Inactive(idle) => Err(AgentError::Inactive { idle }),
            Ending::Overall => Err(AgentError::TimedOut {
                after: self.limits.overall,
            }),
            Ending::Cancelled => Err(AgentError::Cancelled),
        };

        let status = match finished {
            Ok(status) => status,
            Err(err) => {
                let _ = child.kill().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                let keep_token = !matches!(err, AgentError::Inactive { .. });
                if keep_token {
                    warn!(workspace = %workspace.display(), error = %err, "agent run aborted");
                } else {
                    warn!(workspace = %workspace.display(), error = %err, "agent went quiet, discarding its session");
                }
                let log = outcome.output();
                self.update(generation, |h| {
                    h.running = false;
                    h.pid = None;
                    h.continuation_token = if keep_token { token } else { None };
                    h.log = log;
                });
                return Err(err);
            }
        };

        // A grandchild can keep stderr open after the agent itself is gone.
        let stderr = match stderr_task {
            Some(mut task) => match tokio::time::timeout(STDERR_GRACE, &mut task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    task.abort();
                    String::new()
                }
            },
            None => String::new(),
        };
        let output = outcome.output();
        let exit_code = status.code();
        let duration = started.elapsed();
        {
            let token = token.clone();
            let log = output.clone();
            self.update(generation, |h| {
                h.running = false;
                h.pid = None;
                h.continuation_token = token;
                h.log = log;
            });
        }
        info!(
            workspace = %workspace.display(),
            exit_code = ?exit_code,
            duration_secs = duration.as_secs(),
            tool_calls = outcome.tool_calls,
            "coding agent finished"
        );

        if exit_code != Some(0) && output.trim().is_empty() {
            return Err(AgentError::Exited {
                code: exit_code,
                stderr,
            });
        }
        Ok(AgentRun {
            success: exit_code == Some(0),
            output,
            continuation_token: token,
            exit_code,
            duration,
        })
    }
}

fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[async_trait::async_trait]
impl CodingAgent for AgentController {
    async fn start(&self, prompt: &str, workspace: &Path) -> Result<AgentRun, AgentError> {
        self.run(prompt, workspace, Mode::Start).await
    }

    async fn continue_session(
        &self,
        prompt: &str,
        workspace: &Path,
    ) -> Result<AgentRun, AgentError> {
        self.run(prompt, workspace, Mode::Continue).await
    }

    fn status(&self) -> AgentStatus {
        match self.lock().as_ref() {
            None => AgentStatus::default(),
            Some(h) => AgentStatus {
                workspace: Some(h.workspace.clone()),
                running: h.running,
                pid: h.pid,
                started_at: Some(h.started_at_rfc.clone()),
                elapsed: h.running.then(|| h.started_at.elapsed()),
                idle: h.running.then(|| h.activity.idle()),
                has_continuation: h.continuation_token.is_some(),
                output_bytes: h.activity.bytes(),
                log_len: h.log.len(),
            },
        }
    }

    fn can_continue(&self, workspace: &Path) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|h| !h.running && h.workspace == workspace && h.continuation_token.is_some())
    }

    fn occupied_by_other(&self, workspace: &Path) -> Option<PathBuf> {
        self.lock()
            .as_ref()
            .filter(|h| h.running && h.workspace != workspace)
            .map(|h| h.workspace.clone())
    }

    fn end(&self) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|h| h.running) {
            return false;
        }
        slot.take().is_some()
    }

    fn force_cleanup(&self) -> bool {
        match self.lock().take() {
            Some(h) => {
                if h.running {
                    info!(workspace = %h.workspace.display(), pid = ?h.pid, "terminating coding agent");
                    h.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }
}
