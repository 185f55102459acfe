use crate::agent::{AgentError, AgentRun, AgentStatus, CodingAgent};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Which entry point a recorded call came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Start,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub kind: CallKind,
    pub prompt: String,
    pub workspace: PathBuf,
    /// A stored continuation token for this workspace was used.
    pub resumed: bool,
}

#[derive(Default)]
struct MockSlot {
    workspace: Option<PathBuf>,
    token: Option<String>,
    /// A pretend live process elsewhere.
    busy_with: Option<PathBuf>,
}

type Hook = Box<dyn Fn(&Path) + Send + Sync>;

/// Scripted coding agent for tests. Pops queued results per call; when the
/// queue is empty the run succeeds. An optional hook runs inside the
/// workspace first, which is how tests make the "agent" commit.
#[derive(Default)]
pub struct MockAgent {
    results: Mutex<VecDeque<Result<AgentRun, AgentError>>>,
    calls: Mutex<Vec<MockCall>>,
    slot: Mutex<MockSlot>,
    hook: Option<Hook>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn push_result(&self, result: Result<AgentRun, AgentError>) {
        lock(&self.results).push_back(result);
    }

    /// Pretend a process is running for `workspace`.
    pub fn occupy(&self, workspace: &Path) {
        lock(&self.slot).busy_with = Some(workspace.to_path_buf());
    }

    pub fn release(&self) {
        lock(&self.slot).busy_with = None;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn success(output: &str) -> AgentRun {
        AgentRun {
            success: true,
            output: output.to_string(),
            continuation_token: Some("mock-session".into()),
            exit_code: Some(0),
            duration: Duration::from_millis(1),
        }
    }

    fn invoke(&self, kind: CallKind, prompt: &str, workspace: &Path) -> Result<AgentRun, AgentError> {
        let resumed = {
            let slot = lock(&self.slot);
            if let Some(holder) = slot.busy_with.as_ref() {
                if holder != workspace {
                    return Err(AgentError::SlotBusy {
                        holder: holder.clone(),
                    });
                }
                return Err(AgentError::AlreadyRunning {
                    workspace: holder.clone(),
                });
            }
            let resumed =
                slot.workspace.as_deref() == Some(workspace) && slot.token.is_some();
            if kind == CallKind::Continue && !resumed {
                return Err(AgentError::NoContinuation {
                    workspace: workspace.to_path_buf(),
                });
            }
            resumed
        };

        lock(&self.calls).push(MockCall {
            kind,
            prompt: prompt.to_string(),
            workspace: workspace.to_path_buf(),
            resumed,
        });
        if let Some(hook) = &self.hook {
            hook(workspace);
        }

        let result = lock(&self.results)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::success("(mock) fixed")));

        let mut slot = lock(&self.slot);
        if slot.workspace.as_deref() != Some(workspace) {
            slot.token = None;
        }
        slot.workspace = Some(workspace.to_path_buf());
        match &result {
            Ok(run) => {
                if run.continuation_token.is_some() {
                    slot.token = run.continuation_token.clone();
                }
            }
            Err(AgentError::Inactive { .. }) => slot.token = None,
            Err(_) => {}
        }
        result
    }
}

#[async_trait::async_trait]
impl CodingAgent for MockAgent {
    async fn start(&self, prompt: &str, workspace: &Path) -> Result<AgentRun, AgentError> {
        self.invoke(CallKind::Start, prompt, workspace)
    }

    async fn continue_session(
        &self,
        prompt: &str,
        workspace: &Path,
    ) -> Result<AgentRun, AgentError> {
        self.invoke(CallKind::Continue, prompt, workspace)
    }

    fn status(&self) -> AgentStatus {
        let slot = lock(&self.slot);
        match (&slot.busy_with, &slot.workspace) {
            (Some(busy), _) => AgentStatus {
                workspace: Some(busy.clone()),
                running: true,
                ..AgentStatus::default()
            },
            (None, Some(ws)) => AgentStatus {
                workspace: Some(ws.clone()),
                has_continuation: slot.token.is_some(),
                ..AgentStatus::default()
            },
            (None, None) => AgentStatus::default(),
        }
    }

    fn can_continue(&self, workspace: &Path) -> bool {
        let slot = lock(&self.slot);
        slot.busy_with.is_none()
            && slot.workspace.as_deref() == Some(workspace)
            && slot.token.is_some()
    }

    fn occupied_by_other(&self, workspace: &Path) -> Option<PathBuf> {
        lock(&self.slot)
            .busy_with
            .as_ref()
            .filter(|w| w.as_path() != workspace)
            .cloned()
    }

    fn end(&self) -> bool {
        let mut slot = lock(&self.slot);
        if slot.busy_with.is_some() {
            return false;
        }
        let had = slot.workspace.is_some();
        slot.workspace = None;
        slot.token = None;
        had
    }

    fn force_cleanup(&self) -> bool {
        let mut slot = lock(&self.slot);
        let had = slot.busy_with.is_some() || slot.workspace.is_some();
        *slot = MockSlot::default();
        had
    }
}
