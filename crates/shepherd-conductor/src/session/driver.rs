use crate::agent::{AgentError, CodingAgent};
use crate::config::ShepherdConfig;
use crate::failure::{self, decide, prompt, redact, AwaitReason, Decision, FailureInfo, Strategy};
use crate::git::GitOps;
use crate::hosting::{HostingApi, PrRef};
use crate::runner::event_log::{EventLogger, SessionEvent};
use crate::runner::notify::Notifier;
use crate::session::machine::{self, FixAttempt, FixMethod, SessionStatus, WatchSession};
use crate::session::{SessionError, SessionReport, SquashOutcome, StopSummary};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<ShepherdConfig>,
    pub hosting: Arc<dyn HostingApi>,
    pub agent: Arc<dyn CodingAgent>,
    pub git: Arc<GitOps>,
    pub notifier: Arc<dyn Notifier>,
}

/// Result of handling one detected failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// The agent ran and the attempt was recorded.
    Attempted {
        attempt_number: u32,
        method: FixMethod,
        success: bool,
        commit_sha: Option<String>,
    },
    /// The agent was busy with another workspace. Nothing was recorded.
    Skipped { holder: PathBuf },
    AwaitingUser(AwaitReason),
    /// The attempt could not start (workspace or spawn trouble).
    Failed(String),
    /// The session was stopped mid-attempt. Nothing was recorded or pushed.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Not watching; nothing was polled.
    Idle(SessionStatus),
    Pending { pending: usize },
    Success,
    Fix(FixOutcome),
}

/// Drives one [`WatchSession`] through poll, fix, escalate and squash.
///
/// All state changes go through the transition table in
/// [`machine`](crate::session::machine). No lock is held across an await.
/// [`stop`](Self::stop) cancels any attempt still in flight.
pub struct SessionDriver {
    deps: SessionDeps,
    session: Mutex<WatchSession>,
    events: Mutex<EventLogger>,
    cancel: CancellationToken,
}

impl SessionDriver {
    /// Resolve the pull request, provision its workspace and start watching.
    pub async fn open(
        deps: SessionDeps,
        session_id: String,
        pr: PrRef,
        events: EventLogger,
    ) -> Result<Self, SessionError> {
        let info = deps.hosting.resolve_pr(&pr).await?;
        let workspace = deps
            .git
            .provision_workspace(&info.clone_url, &pr.repo, Some(pr.number), &info.branch)
            .await?;
        info!(
            session = %session_id,
            pr = %pr,
            branch = %info.branch,
            workspace = %workspace.display(),
            "session opened"
        );

        let session = WatchSession::new(
            session_id,
            pr,
            info.clone_url,
            info.branch,
            info.base_branch,
            workspace,
            info.head_sha,
        );
        let started = SessionEvent::WatchStarted {
            pr: session.pr.to_string(),
            branch: session.branch.clone(),
            head_sha: session.current_sha.clone(),
            workspace: session.workspace.clone(),
        };
        let driver = Self {
            deps,
            session: Mutex::new(session),
            events: Mutex::new(events),
            cancel: CancellationToken::new(),
        };
        driver.emit(started).await;
        Ok(driver)
    }

    fn lock(&self) -> MutexGuard<'_, WatchSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> WatchSession {
        self.lock().clone()
    }

    pub fn report(&self) -> SessionReport {
        SessionReport::from_session(&self.lock())
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn workspace(&self) -> PathBuf {
        self.lock().workspace.clone()
    }

    /// Cancelled once the session is stopped.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn emit(&self, event: SessionEvent) {
        let description = event.describe();
        let session_id = {
            let mut s = self.lock();
            s.last_event = Some(description.clone());
            s.session_id.clone()
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(&event);
        self.deps.notifier.notify(&session_id, &description).await;
    }

    fn set_status(&self, from: SessionStatus, to: SessionStatus) -> Result<bool, SessionError> {
        let mut s = self.lock();
        machine::transition(&mut s, from, to)
    }

    /// One poll: follow the PR head, read CI, then fix or finish.
    pub async fn tick(&self) -> Result<TickOutcome, SessionError> {
        let (status, pr, workspace, branch, current) = {
            let mut s = self.lock();
            if s.status == SessionStatus::Watching {
                s.last_polled = Some(crate::now_rfc3339());
            }
            (
                s.status,
                s.pr.clone(),
                s.workspace.clone(),
                s.branch.clone(),
                s.current_sha.clone(),
            )
        };
        if status != SessionStatus::Watching {
            return Ok(TickOutcome::Idle(status));
        }

        let info = self.deps.hosting.resolve_pr(&pr).await?;
        let sha = self
            .follow_head(&workspace, &branch, &current, &info.head_sha)
            .await;

        let summary = self.deps.hosting.check_results(&pr.repo, &sha).await?;
        let failure = failure::extract_failure(
            self.deps.hosting.as_ref(),
            &pr.repo,
            &summary,
            &self.deps.config.escalation,
        )
        .await;

        if let Some(failure) = failure {
            if !self.set_status(SessionStatus::Watching, SessionStatus::Fixing)? {
                return Ok(TickOutcome::Idle(self.status()));
            }
            info!(pr = %pr, check = %failure.check_name, app = %failure.app, "check failing");
            self.emit(SessionEvent::CheckFailed {
                check: failure.check_name.clone(),
                app: failure.app.clone(),
            })
            .await;
            let outcome = self.handle_failure(failure, false).await;
            return Ok(TickOutcome::Fix(outcome));
        }

        if summary.all_passing() {
            if !self.set_status(SessionStatus::Watching, SessionStatus::Success)? {
                return Ok(TickOutcome::Idle(self.status()));
            }
            info!(pr = %pr, checks = summary.checks.len(), "all checks passing");
            self.emit(SessionEvent::ChecksPassed {
                count: summary.checks.len(),
            })
            .await;
            return Ok(TickOutcome::Success);
        }

        let pending = summary.pending_count();
        debug!(pr = %pr, pending, "checks pending");
        Ok(TickOutcome::Pending { pending })
    }

    /// Adopt a remote head that descends from ours. A stale one is ignored,
    /// a rewritten one is reported and not followed.
    async fn follow_head(&self, workspace: &Path, branch: &str, current: &str, remote: &str) -> String {
        if remote.is_empty() || remote == current {
            return current.to_string();
        }
        let git = &self.deps.git;
        if let Err(e) = git.fetch(workspace).await {
            warn!(workspace = %workspace.display(), error = %e, "fetch failed, keeping known head");
            return current.to_string();
        }

        if git.is_ancestor(workspace, current, remote).await.unwrap_or(false) {
            if let Err(e) = git.checkout_branch(workspace, branch).await {
                warn!(workspace = %workspace.display(), error = %e, "could not fast-forward workspace");
            }
            {
                self.lock().current_sha = remote.to_string();
            }
            self.emit(SessionEvent::HeadAdvanced {
                from: current.to_string(),
                to: remote.to_string(),
            })
            .await;
            return remote.to_string();
        }

        if git.is_ancestor(workspace, remote, current).await.unwrap_or(false) {
            debug!(remote, current, "reported head is behind ours");
        } else {
            self.emit(SessionEvent::Error {
                message: format!(
                    "remote head {remote} does not descend from {current}; not following a rewritten branch"
                ),
            })
            .await;
        }
        current.to_string()
    }

    /// Decide, then run or defer one fix for a session in `Fixing`.
    /// Always leaves `Fixing`, either back to watching or to awaiting the user.
    async fn handle_failure(&self, mut failure: FailureInfo, unblocked_by_logs: bool) -> FixOutcome {
        let (decision, workspace, branch) = {
            let mut s = self.lock();
            let same_check = s
                .current_failure
                .as_ref()
                .filter(|prev| prev.check_name == failure.check_name);
            if let Some(prev) = same_check.filter(|_| failure.logs.is_none()) {
                failure.logs = prev.logs.clone();
            }
            s.current_failure = Some(failure.clone());
            let prior = s.attempts_for(&failure.check_name);
            let decision = decide(prior, &failure, &self.deps.config.escalation, s.logs_override);
            (decision, s.workspace.clone(), s.branch.clone())
        };

        let (attempt_number, strategy) = match decision {
            Decision::AwaitUser(reason) => {
                let moved = {
                    let mut s = self.lock();
                    let moved = machine::transition(
                        &mut s,
                        SessionStatus::Fixing,
                        SessionStatus::AwaitingUser,
                    );
                    if let Ok(true) = moved {
                        s.awaiting_reason = Some(reason.to_string());
                    }
                    moved
                };
                if let Ok(true) = moved {
                    info!(check = %failure.check_name, %reason, "awaiting user");
                    self.emit(SessionEvent::AwaitingUser {
                        check: failure.check_name.clone(),
                        reason: reason.to_string(),
                    })
                    .await;
                }
                return FixOutcome::AwaitingUser(reason);
            }
            Decision::Attempt {
                attempt_number,
                strategy,
            } => (attempt_number, strategy),
        };

        let outcome = self
            .attempt(failure, attempt_number, strategy, unblocked_by_logs, &workspace, &branch)
            .await;
        if let Err(e) = self.set_status(SessionStatus::Fixing, SessionStatus::Watching) {
            warn!(error = %e, "could not return to watching");
        }
        outcome
    }

    async fn attempt(
        &self,
        failure: FailureInfo,
        attempt_number: u32,
        strategy: Strategy,
        unblocked_by_logs: bool,
        workspace: &Path,
        branch: &str,
    ) -> FixOutcome {
        let agent = &self.deps.agent;
        let git = &self.deps.git;
        let check = failure.check_name.clone();

        if self.cancel.is_cancelled() {
            return FixOutcome::Cancelled;
        }
        if let Some(holder) = agent.occupied_by_other(workspace) {
            return self.skip(check, holder).await;
        }
        if let Err(e) = git.ensure_on_branch(workspace, branch).await {
            return self.fail(format!("workspace resync failed: {e}")).await;
        }
        let before = match git.head_sha(workspace).await {
            Ok(sha) => sha,
            Err(e) => return self.fail(format!("could not read workspace head: {e}")).await,
        };

        let method = match strategy {
            _ if unblocked_by_logs => FixMethod::Manual,
            Strategy::Templated => FixMethod::Templated,
            _ => FixMethod::DeepAnalysis,
        };
        let text = match strategy {
            Strategy::Templated => prompt::templated(
                &failure,
                branch,
                self.deps.config.escalation.templated_annotation_limit,
            ),
            _ => prompt::deep_analysis(&failure, branch, attempt_number - 1),
        };

        info!(check = %check, attempt = attempt_number, %method, "starting fix");
        self.emit(SessionEvent::FixStarted {
            check: check.clone(),
            attempt: attempt_number,
            method,
        })
        .await;

        let resume = strategy != Strategy::Templated && agent.can_continue(workspace);
        let run = async {
            if resume {
                match agent.continue_session(&text, workspace).await {
                    Err(AgentError::NoContinuation { .. }) => agent.start(&text, workspace).await,
                    other => other,
                }
            } else {
                agent.start(&text, workspace).await
            }
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // stop() may have looked at the slot before this run claimed it
                if agent.holds_slot(workspace) {
                    agent.force_cleanup();
                }
                info!(check = %check, attempt = attempt_number, "session stopped, fix abandoned");
                return FixOutcome::Cancelled;
            }
            result = run => result,
        };

        let (response, mut success) = match result {
            Ok(run) => (run.output, run.success),
            Err(AgentError::SlotBusy { holder }) => return self.skip(check, holder).await,
            Err(AgentError::Cancelled) => return FixOutcome::Cancelled,
            Err(e @ (AgentError::TimedOut { .. } | AgentError::Inactive { .. })) => {
                let inactivity = matches!(e, AgentError::Inactive { .. });
                warn!(check = %check, attempt = attempt_number, error = %e, "agent timed out");
                self.emit(SessionEvent::AgentTimedOut {
                    check: check.clone(),
                    attempt: attempt_number,
                    inactivity,
                })
                .await;
                (e.to_string(), false)
            }
            Err(e @ AgentError::Exited { .. }) => (e.to_string(), false),
            Err(e) => return self.fail(format!("agent could not run: {e}")).await,
        };

        let commit_sha = match git.head_sha(workspace).await {
            Ok(after) if after != before => Some(after),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "could not read head after fix");
                None
            }
        };
        if self.cancel.is_cancelled() {
            info!(check = %check, attempt = attempt_number, "session stopped, fix not pushed");
            return FixOutcome::Cancelled;
        }
        match &commit_sha {
            Some(sha) if !success => {
                info!(check = %check, sha = %sha, "agent run failed, keeping its commits local");
            }
            Some(sha) => match git.push(workspace, branch).await {
                Ok(()) => {
                    info!(check = %check, sha = %sha, "pushed fix");
                    self.lock().current_sha = sha.clone();
                }
                Err(e) => {
                    warn!(check = %check, error = %e, "push rejected");
                    success = false;
                    self.emit(SessionEvent::PushRejected {
                        check: check.clone(),
                        error: e.to_string(),
                    })
                    .await;
                }
            },
            None => {}
        }

        {
            let mut s = self.lock();
            s.record_attempt(FixAttempt {
                timestamp: crate::now_rfc3339(),
                failure,
                attempt_number,
                method,
                agent_response: response,
                commit_sha: commit_sha.clone(),
                success,
            });
            s.logs_override = false;
        }
        self.emit(SessionEvent::FixCompleted {
            check,
            attempt: attempt_number,
            method,
            success,
            commit_sha: commit_sha.clone(),
        })
        .await;

        FixOutcome::Attempted {
            attempt_number,
            method,
            success,
            commit_sha,
        }
    }

    async fn skip(&self, check: String, holder: PathBuf) -> FixOutcome {
        {
            self.lock().skipped_attempts += 1;
        }
        info!(check = %check, holder = %holder.display(), "agent busy elsewhere, skipping");
        self.emit(SessionEvent::FixSkipped {
            check,
            holder: holder.clone(),
        })
        .await;
        FixOutcome::Skipped { holder }
    }

    async fn fail(&self, message: String) -> FixOutcome {
        warn!(%message, "fix attempt not started");
        self.emit(SessionEvent::Error {
            message: message.clone(),
        })
        .await;
        FixOutcome::Failed(message)
    }

    /// Attach user-supplied CI logs to the current failure and run the next
    /// attempt now. Past the ceiling this grants exactly one more attempt.
    pub async fn resume_with_logs(&self, logs: &str) -> Result<FixOutcome, SessionError> {
        let failure = self.attach_logs(logs).await?;
        Ok(self.fix_with_logs(failure).await)
    }

    /// First half of [`resume_with_logs`](Self::resume_with_logs): store the
    /// masked logs and move to `Fixing`. The returned failure is what
    /// [`fix_with_logs`](Self::fix_with_logs) should run.
    pub async fn attach_logs(&self, logs: &str) -> Result<FailureInfo, SessionError> {
        let escalation = &self.deps.config.escalation;
        let failure = {
            let mut s = self.lock();
            let status = s.status;
            let mut failure = match (status, s.current_failure.clone()) {
                (SessionStatus::AwaitingUser, Some(f)) => f,
                _ => return Err(SessionError::NotAwaitingLogs { status }),
            };
            failure.logs = Some(redact::sanitize_logs(logs, escalation.max_log_chars));
            s.current_failure = Some(failure.clone());
            if s.attempts_for(&failure.check_name) >= escalation.max_attempts_per_check {
                s.logs_override = true;
            }
            machine::transition(&mut s, SessionStatus::AwaitingUser, SessionStatus::Fixing)?;
            failure
        };

        self.emit(SessionEvent::LogsProvided {
            check: failure.check_name.clone(),
            chars: failure.logs.as_deref().map_or(0, |l| l.chars().count()),
        })
        .await;
        Ok(failure)
    }

    pub async fn fix_with_logs(&self, failure: FailureInfo) -> FixOutcome {
        self.handle_failure(failure, true).await
    }

    /// Journal an error raised outside the driver, such as a failed poll.
    pub async fn report_error(&self, message: String) {
        self.emit(SessionEvent::Error { message }).await;
    }

    /// Collapse every commit since the watch began into one and force-push.
    pub async fn squash(&self, message: &str) -> Result<SquashOutcome, SessionError> {
        let (status, workspace, branch, base) = {
            let s = self.lock();
            (
                s.status,
                s.workspace.clone(),
                s.branch.clone(),
                s.initial_commit_sha.clone(),
            )
        };
        if status != SessionStatus::Success {
            return Err(SessionError::NotSuccess { status });
        }

        let git = &self.deps.git;
        let result = match git.ensure_on_branch(&workspace, &branch).await {
            Ok(_) => git.squash(&workspace, &base, message, &branch).await,
            Err(e) => Err(e),
        };
        let squashed = match result {
            Ok(r) => r,
            Err(e) => {
                self.emit(SessionEvent::Error {
                    message: format!("squash failed: {e}"),
                })
                .await;
                return Err(e.into());
            }
        };

        {
            self.lock().current_sha = squashed.new_sha.clone();
        }
        self.emit(SessionEvent::Squashed {
            new_sha: squashed.new_sha.clone(),
            commits_removed: squashed.commits_removed,
        })
        .await;
        Ok(SquashOutcome {
            new_sha: squashed.new_sha,
            commits_removed: squashed.commits_removed,
        })
    }

    /// Stop from any state, killing the agent if this session holds it.
    pub async fn stop(&self, reason: &str) -> StopSummary {
        let (previous_status, workspace, summary) = {
            let mut s = self.lock();
            let previous = machine::stop(&mut s);
            self.cancel.cancel();
            let summary = StopSummary {
                session_id: s.session_id.clone(),
                pr: s.pr.to_string(),
                previous_status: previous,
                fix_attempts: s.fix_attempts,
                skipped_attempts: s.skipped_attempts,
                killed_agent: false,
            };
            (previous, s.workspace.clone(), summary)
        };

        let killed_agent = self.deps.agent.holds_slot(&workspace) && self.deps.agent.force_cleanup();
        if previous_status != SessionStatus::Stopped {
            info!(session = %summary.session_id, previous = %previous_status, killed_agent, "session stopped");
            self.emit(SessionEvent::Stopped {
                reason: reason.to_string(),
            })
            .await;
        }
        StopSummary {
            killed_agent,
            ..summary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::CallKind;
    use crate::agent::{AgentRun, MockAgent};
    use crate::git::testutil::{commit_file, git, identify, remote, Remote};
    use crate::hosting::mock::MockHosting;
    use crate::hosting::{Annotation, CheckDetail, CheckEntry, CheckKind, CheckState, CheckSummary, PrInfo};
    use crate::runner::notify::CollectNotifier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        remote: Remote,
        hosting: Arc<MockHosting>,
        agent: Arc<MockAgent>,
        notifier: Arc<CollectNotifier>,
        deps: SessionDeps,
        initial: String,
    }

    impl Harness {
        async fn open(&self) -> SessionDriver {
            SessionDriver::open(
                self.deps.clone(),
                "s1".into(),
                "acme/widgets#42".parse().unwrap(),
                EventLogger::disabled("s1"),
            )
            .await
            .unwrap()
        }

        fn remote_head(&self) -> String {
            git(&self.remote.seed, &["ls-remote", "origin", "refs/heads/fix-ci"])
        }

        fn said(&self, needle: &str) -> bool {
            self.notifier.messages().iter().any(|m| m.contains(needle))
        }
    }

    fn harness(make_agent: impl FnOnce(&Remote) -> MockAgent) -> Harness {
        let remote = remote();
        let initial = git(&remote.seed, &["rev-parse", "origin/fix-ci"]);
        let hosting = Arc::new(MockHosting::new());
        hosting.set_pr(
            42,
            PrInfo {
                head_sha: initial.clone(),
                branch: "fix-ci".into(),
                base_branch: "main".into(),
                clone_url: remote.url.clone(),
            },
        );
        let config = ShepherdConfig {
            workspaces_root: Some(remote.workspaces()),
            ..ShepherdConfig::default()
        };
        let agent = Arc::new(make_agent(&remote));
        let notifier = Arc::new(CollectNotifier::new());
        let deps = SessionDeps {
            git: Arc::new(GitOps::from_config(&config)),
            config: Arc::new(config),
            hosting: hosting.clone(),
            agent: agent.clone(),
            notifier: notifier.clone(),
        };
        Harness {
            remote,
            hosting,
            agent,
            notifier,
            deps,
            initial,
        }
    }

    /// An agent that makes `n` commits per run.
    fn committing(n: usize) -> impl FnOnce(&Remote) -> MockAgent {
        move |_: &Remote| {
            let counter = AtomicUsize::new(0);
            MockAgent::new().with_hook(move |ws| {
                identify(ws);
                for _ in 0..n {
                    let i = counter.fetch_add(1, Ordering::SeqCst);
                    commit_file(ws, &format!("fix-{i}.txt"), "ok", &format!("fix {i}"));
                }
            })
        }
    }

    fn check(name: &str, state: CheckState, app: &str, run_id: Option<u64>) -> CheckEntry {
        CheckEntry {
            name: name.into(),
            kind: if run_id.is_some() { CheckKind::CheckRun } else { CheckKind::LegacyStatus },
            state,
            url: format!("https://ci.example/{name}"),
            app: app.into(),
            run_id,
        }
    }

    fn failing_actions() -> CheckSummary {
        CheckSummary {
            checks: vec![
                check("lint", CheckState::Passing, "github-actions", Some(6)),
                check("unit-tests", CheckState::Failing, "github-actions", Some(7)),
            ],
        }
    }

    fn all_passing() -> CheckSummary {
        CheckSummary {
            checks: vec![
                check("lint", CheckState::Passing, "github-actions", Some(6)),
                check("unit-tests", CheckState::Passing, "github-actions", Some(8)),
            ],
        }
    }

    fn detail() -> CheckDetail {
        CheckDetail {
            annotations: vec![Annotation {
                path: "src/widget.rs".into(),
                line: Some(12),
                message: "assertion failed: left == right".into(),
            }],
            failed_steps: vec!["test / cargo test".into()],
        }
    }

    #[tokio::test]
    async fn fix_push_pass_then_squash() {
        let h = harness(committing(2));
        h.hosting.push_checks(failing_actions());
        h.hosting.push_checks(all_passing());
        h.hosting.set_detail(7, detail());
        let d = h.open().await;
        assert_eq!(d.status(), SessionStatus::Watching);
        assert_eq!(d.snapshot().initial_commit_sha, h.initial);

        let sha = match d.tick().await.unwrap() {
            TickOutcome::Fix(FixOutcome::Attempted {
                attempt_number: 1,
                method: FixMethod::Templated,
                success: true,
                commit_sha: Some(sha),
            }) => sha,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let s = d.snapshot();
        assert_eq!(s.status, SessionStatus::Watching);
        assert_eq!(s.fix_history.len(), 1);
        assert_eq!(s.fix_attempts, 1);
        assert!(s.fix_history[0].success);
        assert_eq!(s.current_sha, sha);
        assert!(h.remote_head().starts_with(&sha));

        let calls = h.agent.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].prompt.contains("src/widget.rs:12"));
        assert!(calls[0].prompt.contains("test / cargo test"));

        assert_eq!(d.tick().await.unwrap(), TickOutcome::Success);
        assert_eq!(h.hosting.check_calls()[1], sha);
        assert_eq!(d.tick().await.unwrap(), TickOutcome::Idle(SessionStatus::Success));

        let squashed = d.squash("fix: unit tests").await.unwrap();
        assert_eq!(squashed.commits_removed, 1);
        assert!(h.remote_head().starts_with(&squashed.new_sha));
        assert_eq!(d.snapshot().current_sha, squashed.new_sha);
        assert!(h.said("squashed 1 commit(s)"));

        let summary = d.stop("done").await;
        assert_eq!(summary.previous_status, SessionStatus::Success);
        assert!(!summary.killed_agent);
        assert_eq!(d.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn escalates_then_waits_for_logs() {
        let h = harness(|_| MockAgent::new());
        h.hosting.push_checks(failing_actions());
        h.hosting.set_detail(7, detail());
        let d = h.open().await;

        let mut methods = Vec::new();
        for expected in 1..=3 {
            match d.tick().await.unwrap() {
                TickOutcome::Fix(FixOutcome::Attempted { attempt_number, method, success: true, commit_sha: None }) => {
                    assert_eq!(attempt_number, expected);
                    methods.push(method);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(
            methods,
            vec![FixMethod::Templated, FixMethod::DeepAnalysis, FixMethod::DeepAnalysis]
        );
        let kinds: Vec<CallKind> = h.agent.calls().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::Start, CallKind::Continue, CallKind::Continue]);

        assert_eq!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::AwaitingUser(AwaitReason::CeilingReached { attempts: 3 }))
        );
        assert_eq!(d.status(), SessionStatus::AwaitingUser);
        assert!(d.report().awaiting_reason.is_some());
        assert_eq!(d.tick().await.unwrap(), TickOutcome::Idle(SessionStatus::AwaitingUser));
        assert_eq!(h.agent.calls().len(), 3);

        let outcome = d
            .resume_with_logs("thread 'widget' panicked\npassword=hunter2")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FixOutcome::Attempted { attempt_number: 4, method: FixMethod::Manual, .. }
        ));
        let last = h.agent.calls().pop().unwrap();
        assert!(last.prompt.contains("thread 'widget' panicked"));
        assert!(last.prompt.contains("password=[MASKED]"));
        assert!(!last.prompt.contains("hunter2"));

        let s = d.snapshot();
        assert_eq!(s.status, SessionStatus::Watching);
        assert_eq!(s.fix_attempts, 4);
        assert!(!s.logs_override);
        let numbers: Vec<u32> = s.fix_history.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);

        // the override is spent
        assert_eq!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::AwaitingUser(AwaitReason::CeilingReached { attempts: 4 }))
        );
    }

    #[tokio::test]
    async fn opaque_ci_asks_for_logs_on_third_attempt() {
        let h = harness(|_| MockAgent::new());
        h.hosting.push_checks(CheckSummary {
            checks: vec![check("ci/jenkins", CheckState::Failing, "jenkins", None)],
        });
        let d = h.open().await;

        assert!(matches!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::Attempted { method: FixMethod::Templated, .. })
        ));
        assert!(matches!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::Attempted { method: FixMethod::DeepAnalysis, .. })
        ));
        assert_eq!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::AwaitingUser(AwaitReason::LogsRequired))
        );
        assert_eq!(d.snapshot().fix_history.len(), 2);
        assert!(h.said("awaiting user for 'ci/jenkins'"));

        let outcome = d.resume_with_logs("BUILD FAILED at step compile").await.unwrap();
        assert!(matches!(
            outcome,
            FixOutcome::Attempted { attempt_number: 3, method: FixMethod::Manual, .. }
        ));
        assert!(!d.snapshot().logs_override);
        assert!(h.said("logs provided for 'ci/jenkins'"));
    }

    #[tokio::test]
    async fn busy_agent_skips_without_recording() {
        let h = harness(|_| MockAgent::new());
        h.hosting.push_checks(failing_actions());
        let d = h.open().await;
        h.agent.occupy(Path::new("/elsewhere/acme-gadgets-pr-7"));

        assert_eq!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::Skipped {
                holder: PathBuf::from("/elsewhere/acme-gadgets-pr-7")
            })
        );
        let s = d.snapshot();
        assert_eq!(s.status, SessionStatus::Watching);
        assert_eq!(s.skipped_attempts, 1);
        assert_eq!(s.fix_attempts, 0);
        assert!(s.fix_history.is_empty());
        assert!(h.agent.calls().is_empty());
        assert!(h.said("agent busy"));

        h.agent.release();
        assert!(matches!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::Attempted { attempt_number: 1, .. })
        ));
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let h = harness(|_| MockAgent::new());
        h.hosting.push_checks(failing_actions());
        h.agent.push_result(Err(AgentError::Inactive {
            idle: Duration::from_secs(300),
        }));
        let d = h.open().await;

        assert_eq!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::Attempted {
                attempt_number: 1,
                method: FixMethod::Templated,
                success: false,
                commit_sha: None,
            })
        );
        assert_eq!(d.snapshot().fix_attempts, 1);
        assert!(h.said("hit the inactivity timeout"));
    }

    #[tokio::test]
    async fn rejected_push_fails_attempt_and_keeps_head() {
        let h = harness(|remote: &Remote| {
            let seed = remote.seed.clone();
            MockAgent::new().with_hook(move |ws| {
                git(&seed, &["checkout", "fix-ci"]);
                commit_file(&seed, "collab.txt", "theirs", "collaborator change");
                git(&seed, &["push", "origin", "fix-ci"]);
                identify(ws);
                commit_file(ws, "fix.txt", "ours", "fix");
            })
        });
        h.hosting.push_checks(failing_actions());
        let d = h.open().await;

        match d.tick().await.unwrap() {
            TickOutcome::Fix(FixOutcome::Attempted { success, commit_sha, .. }) => {
                assert!(!success);
                assert!(commit_sha.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(d.snapshot().current_sha, h.initial);
        assert!(h.said("push rejected"));
    }

    #[tokio::test]
    async fn failed_run_commits_are_not_pushed() {
        let h = harness(committing(1));
        h.hosting.push_checks(failing_actions());
        h.agent.push_result(Ok(AgentRun {
            success: false,
            exit_code: Some(1),
            ..MockAgent::success("gave up halfway")
        }));
        let d = h.open().await;

        match d.tick().await.unwrap() {
            TickOutcome::Fix(FixOutcome::Attempted {
                success: false,
                commit_sha: Some(_),
                ..
            }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(d.snapshot().current_sha, h.initial);
        assert!(h.remote_head().starts_with(&h.initial));
        assert!(!h.said("push rejected"));
    }

    /// Holds up "check failing" notifications so a stop can land mid-tick.
    struct SlowFailureNotifier;

    #[async_trait::async_trait]
    impl Notifier for SlowFailureNotifier {
        async fn notify(&self, _session_id: &str, message: &str) {
            if message.contains("failing") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
    }

    #[tokio::test]
    async fn stop_during_tick_abandons_fix() {
        let h = harness(committing(1));
        h.hosting.push_checks(failing_actions());
        let deps = SessionDeps {
            notifier: Arc::new(SlowFailureNotifier),
            ..h.deps.clone()
        };
        let d = Arc::new(
            SessionDriver::open(
                deps,
                "s1".into(),
                "acme/widgets#42".parse().unwrap(),
                EventLogger::disabled("s1"),
            )
            .await
            .unwrap(),
        );

        let ticking = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.tick().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let summary = d.stop("user request").await;
        assert_eq!(summary.previous_status, SessionStatus::Fixing);
        assert!(!summary.killed_agent);

        assert_eq!(
            ticking.await.unwrap().unwrap(),
            TickOutcome::Fix(FixOutcome::Cancelled)
        );
        assert!(h.agent.calls().is_empty());
        let s = d.snapshot();
        assert_eq!(s.status, SessionStatus::Stopped);
        assert!(s.fix_history.is_empty());
        assert!(h.remote_head().starts_with(&h.initial));
        assert!(d.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn fix_with_logs_after_stop_is_abandoned() {
        let h = harness(|_| MockAgent::new());
        h.hosting.push_checks(CheckSummary {
            checks: vec![check("ci/jenkins", CheckState::Failing, "jenkins", None)],
        });
        let d = h.open().await;
        d.tick().await.unwrap();
        d.tick().await.unwrap();
        assert_eq!(
            d.tick().await.unwrap(),
            TickOutcome::Fix(FixOutcome::AwaitingUser(AwaitReason::LogsRequired))
        );

        let failure = d.attach_logs("BUILD FAILED").await.unwrap();
        d.stop("user request").await;
        assert_eq!(d.fix_with_logs(failure).await, FixOutcome::Cancelled);
        assert_eq!(h.agent.calls().len(), 2);
        assert_eq!(d.snapshot().fix_history.len(), 2);
        assert_eq!(d.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn squash_requires_success() {
        let h = harness(|_| MockAgent::new());
        let d = h.open().await;
        let err = d.squash("fix: unit tests").await.unwrap_err();
        assert!(matches!(err, SessionError::NotSuccess { status: SessionStatus::Watching }));
        let head = git(&d.workspace(), &["rev-parse", "HEAD"]);
        assert_eq!(head, h.initial);
    }

    #[tokio::test]
    async fn logs_rejected_unless_awaiting() {
        let h = harness(|_| MockAgent::new());
        let d = h.open().await;
        let err = d.resume_with_logs("logs").await.unwrap_err();
        assert!(matches!(err, SessionError::NotAwaitingLogs { .. }));
    }

    #[tokio::test]
    async fn stop_kills_agent_held_by_session() {
        let h = harness(|_| MockAgent::new());
        let d = h.open().await;
        h.agent.occupy(&d.workspace());

        let summary = d.stop("user request").await;
        assert!(summary.killed_agent);
        assert_eq!(summary.previous_status, SessionStatus::Watching);
        assert!(!h.agent.status().running);
        assert_eq!(d.tick().await.unwrap(), TickOutcome::Idle(SessionStatus::Stopped));
        assert!(h.said("stopped: user request"));
    }

    #[tokio::test]
    async fn follows_collaborator_push() {
        let h = harness(|_| MockAgent::new());
        h.hosting.push_checks(CheckSummary {
            checks: vec![check("lint", CheckState::Pending, "github-actions", Some(6))],
        });
        let d = h.open().await;

        let pushed = h.remote.push_commit("fix-ci", "collab.txt");
        h.hosting.set_head(42, &pushed);
        assert_eq!(d.tick().await.unwrap(), TickOutcome::Pending { pending: 1 });
        assert_eq!(d.snapshot().current_sha, pushed);
        assert_eq!(git(&d.workspace(), &["rev-parse", "HEAD"]), pushed);
        assert_eq!(h.hosting.check_calls().last().unwrap(), &pushed);
    }
}
