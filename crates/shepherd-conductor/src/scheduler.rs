//! Multi-session scheduler: one polling task per watched pull request.
//!
//! Sessions poll concurrently. Each session's progression stays sequential
//! because only its own task ticks it. Agent exclusivity is not handled here;
//! the controller owns the slot and sessions that lose the race skip a turn.

use crate::hosting::{PrRef, PrRefError};
use crate::runner::event_log::EventLogger;
use crate::session::{
    SessionDeps, SessionDriver, SessionError, SessionReport, SessionStatus, SquashOutcome,
    StopSummary, TickOutcome,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `shutdown` waits for each polling task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("{pr} is already watched by session {session_id}")]
    AlreadyWatching { pr: String, session_id: String },
    #[error(transparent)]
    PrRef(#[from] PrRefError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

struct SessionCell {
    pr: PrRef,
    driver: Arc<SessionDriver>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    deps: SessionDeps,
    journal: bool,
    sessions: Mutex<HashMap<String, SessionCell>>,
}

fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn same_pr(a: &PrRef, b: &PrRef) -> bool {
    a.repo == b.repo && a.number == b.number
}

impl Scheduler {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            journal: true,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Do not write `events.jsonl` for new sessions.
    pub fn without_journal(mut self) -> Self {
        self.journal = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionCell>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn watcher_of(sessions: &HashMap<String, SessionCell>, pr: &PrRef) -> Option<String> {
        sessions
            .iter()
            .find(|(_, cell)| same_pr(&cell.pr, pr))
            .map(|(id, _)| id.clone())
    }

    fn cell(&self, session_id: &str) -> Result<(Arc<SessionDriver>, Arc<Notify>), SchedulerError> {
        self.lock()
            .get(session_id)
            .map(|cell| (cell.driver.clone(), cell.wake.clone()))
            .ok_or_else(|| SchedulerError::UnknownSession(session_id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Open a session for `reference` and start polling it.
    /// Returns the new session id.
    pub async fn start_watching(&self, reference: &str) -> Result<String, SchedulerError> {
        let pr: PrRef = reference.parse()?;
        let existing = Self::watcher_of(&self.lock(), &pr);
        if let Some(session_id) = existing {
            return Err(SchedulerError::AlreadyWatching {
                pr: pr.to_string(),
                session_id,
            });
        }

        let session_id = new_session_id();
        let events = if self.journal {
            EventLogger::for_session(&session_id)
        } else {
            EventLogger::disabled(&session_id)
        };
        let driver = Arc::new(
            SessionDriver::open(self.deps.clone(), session_id.clone(), pr.clone(), events).await?,
        );

        // Another caller may have opened the same PR while we were cloning.
        let raced = {
            let mut sessions = self.lock();
            match Self::watcher_of(&sessions, &pr) {
                Some(other) => Some(other),
                None => {
                    let cancel = driver.cancellation();
                    let wake = Arc::new(Notify::new());
                    let task = tokio::spawn(poll_loop(
                        driver.clone(),
                        self.deps.config.poll_interval(),
                        cancel.clone(),
                        wake.clone(),
                    ));
                    sessions.insert(
                        session_id.clone(),
                        SessionCell {
                            pr: pr.clone(),
                            driver: driver.clone(),
                            cancel,
                            wake,
                            task,
                        },
                    );
                    None
                }
            }
        };
        if let Some(other) = raced {
            driver.stop("duplicate watch").await;
            return Err(SchedulerError::AlreadyWatching {
                pr: pr.to_string(),
                session_id: other,
            });
        }

        info!(session = %session_id, pr = %pr, "watching");
        Ok(session_id)
    }

    /// Stop one session, or every session when `session_id` is `None`.
    /// Stopped sessions are removed.
    pub async fn stop(&self, session_id: Option<&str>) -> Result<Vec<StopSummary>, SchedulerError> {
        let cells: Vec<SessionCell> = {
            let mut sessions = self.lock();
            match session_id {
                Some(id) => vec![sessions
                    .remove(id)
                    .ok_or_else(|| SchedulerError::UnknownSession(id.to_string()))?],
                None => sessions.drain().map(|(_, cell)| cell).collect(),
            }
        };
        let (summaries, _tasks) = stop_cells(cells, "stop requested").await;
        Ok(summaries)
    }

    /// Stop everything and wait briefly for the polling tasks to exit.
    pub async fn shutdown(&self) -> Vec<StopSummary> {
        let cells: Vec<SessionCell> = self.lock().drain().map(|(_, cell)| cell).collect();
        let (summaries, tasks) = stop_cells(cells, "shutdown").await;
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("polling task did not exit within {SHUTDOWN_GRACE:?}");
            }
        }
        summaries
    }

    /// Reports for every live session, ordered by session id.
    pub fn status(&self) -> Vec<SessionReport> {
        let drivers: Vec<Arc<SessionDriver>> =
            self.lock().values().map(|cell| cell.driver.clone()).collect();
        let mut reports: Vec<SessionReport> = drivers.iter().map(|d| d.report()).collect();
        reports.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        reports
    }

    /// Hand user-supplied CI logs to a session awaiting them. The session
    /// enters `fixing` before this returns; the attempt itself runs in the
    /// background and is abandoned if the session is stopped meanwhile.
    pub async fn provide_logs(&self, session_id: &str, logs: &str) -> Result<(), SchedulerError> {
        let (driver, wake) = self.cell(session_id)?;
        let failure = driver.attach_logs(logs).await?;
        let session = session_id.to_string();
        tokio::spawn(async move {
            let outcome = driver.fix_with_logs(failure).await;
            debug!(session = %session, ?outcome, "fix with supplied logs finished");
            wake.notify_one();
        });
        Ok(())
    }

    pub async fn squash(&self, session_id: &str, message: &str) -> Result<SquashOutcome, SchedulerError> {
        let (driver, _) = self.cell(session_id)?;
        Ok(driver.squash(message).await?)
    }
}

async fn stop_cells(cells: Vec<SessionCell>, reason: &str) -> (Vec<StopSummary>, Vec<JoinHandle<()>>) {
    let mut summaries = Vec::with_capacity(cells.len());
    let mut tasks = Vec::with_capacity(cells.len());
    for cell in cells {
        summaries.push(cell.driver.stop(reason).await);
        cell.cancel.cancel();
        tasks.push(cell.task);
    }
    summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    (summaries, tasks)
}

/// Tick on every interval or wake-up until cancelled or stopped.
/// A tick already in progress runs on until the driver notices the stop,
/// which it checks before launching the agent and before pushing.
async fn poll_loop(
    driver: Arc<SessionDriver>,
    interval: Duration,
    cancel: CancellationToken,
    wake: Arc<Notify>,
) {
    let session = driver.session_id();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        match driver.tick().await {
            Ok(TickOutcome::Idle(SessionStatus::Stopped)) => break,
            Ok(outcome) => debug!(session = %session, ?outcome, "tick"),
            Err(e) => {
                warn!(session = %session, error = %e, "poll failed");
                driver.report_error(format!("poll failed: {e}")).await;
            }
        }
    }
    debug!(session = %session, "polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::config::ShepherdConfig;
    use crate::git::testutil::{commit_file, git, identify, remote, Remote};
    use crate::git::{GitOps, WorkspaceKey};
    use crate::hosting::mock::MockHosting;
    use crate::hosting::{CheckEntry, CheckKind, CheckState, CheckSummary, PrInfo, RepoSlug};
    use crate::runner::notify::CollectNotifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _remote: Remote,
        hosting: Arc<MockHosting>,
        agent: Arc<MockAgent>,
        git: Arc<GitOps>,
        scheduler: Scheduler,
    }

    fn fixture(agent: MockAgent, tweak: impl FnOnce(&mut ShepherdConfig)) -> Fixture {
        let remote = remote();
        let head = git(&remote.seed, &["rev-parse", "origin/fix-ci"]);
        let hosting = Arc::new(MockHosting::new());
        hosting.set_pr(
            42,
            PrInfo {
                head_sha: head,
                branch: "fix-ci".into(),
                base_branch: "main".into(),
                clone_url: remote.url.clone(),
            },
        );
        let mut config = ShepherdConfig {
            poll_interval_secs: 1,
            workspaces_root: Some(remote.workspaces()),
            ..ShepherdConfig::default()
        };
        tweak(&mut config);
        let agent = Arc::new(agent);
        let git = Arc::new(GitOps::from_config(&config));
        let deps = SessionDeps {
            config: Arc::new(config),
            hosting: hosting.clone(),
            agent: agent.clone(),
            git: git.clone(),
            notifier: Arc::new(CollectNotifier::new()),
        };
        Fixture {
            _remote: remote,
            hosting,
            agent,
            git,
            scheduler: Scheduler::new(deps).without_journal(),
        }
    }

    fn committing_agent() -> MockAgent {
        let counter = AtomicUsize::new(0);
        MockAgent::new().with_hook(move |ws| {
            identify(ws);
            for _ in 0..2 {
                let i = counter.fetch_add(1, Ordering::SeqCst);
                commit_file(ws, &format!("fix-{i}.txt"), "ok", &format!("fix {i}"));
            }
        })
    }

    fn summary(state: CheckState) -> CheckSummary {
        CheckSummary {
            checks: vec![CheckEntry {
                name: "unit-tests".into(),
                kind: CheckKind::CheckRun,
                state,
                url: "https://ci.example/unit-tests".into(),
                app: "github-actions".into(),
                run_id: Some(7),
            }],
        }
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn status_of(f: &Fixture, id: &str) -> Option<SessionStatus> {
        f.scheduler
            .status()
            .into_iter()
            .find(|r| r.session_id == id)
            .map(|r| r.status)
    }

    #[tokio::test]
    async fn watch_fix_pass_squash_stop() {
        let f = fixture(committing_agent(), |_| {});
        f.hosting.push_checks(summary(CheckState::Failing));
        f.hosting.push_checks(summary(CheckState::Passing));

        let id = f.scheduler.start_watching("acme/widgets#42").await.unwrap();
        assert_eq!(id.len(), 8);
        wait_until("success", || status_of(&f, &id) == Some(SessionStatus::Success)).await;

        let reports = f.scheduler.status();
        let report = &reports[0];
        assert_eq!(report.fix_attempts, 1);
        assert_eq!(report.attempts_by_check["unit-tests"], 1);
        assert_eq!(report.pr, "acme/widgets#42");

        let squashed = f.scheduler.squash(&id, "fix: unit tests").await.unwrap();
        assert_eq!(squashed.commits_removed, 1);

        let stopped = f.scheduler.stop(Some(&id)).await.unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].previous_status, SessionStatus::Success);
        assert!(f.scheduler.is_empty());
    }

    #[tokio::test]
    async fn duplicate_watch_is_rejected() {
        let f = fixture(MockAgent::new(), |_| {});
        f.hosting.push_checks(summary(CheckState::Pending));
        let id = f.scheduler.start_watching("acme/widgets#42").await.unwrap();

        let err = f
            .scheduler
            .start_watching("https://github.com/acme/widgets/pull/42")
            .await
            .unwrap_err();
        match err {
            SchedulerError::AlreadyWatching { session_id, .. } => assert_eq!(session_id, id),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.scheduler.session_ids(), vec![id]);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn bad_reference_and_unknown_session() {
        let f = fixture(MockAgent::new(), |_| {});
        assert!(matches!(
            f.scheduler.start_watching("widgets 42").await,
            Err(SchedulerError::PrRef(_))
        ));
        assert!(matches!(
            f.scheduler.provide_logs("deadbeef", "logs").await,
            Err(SchedulerError::UnknownSession(_))
        ));
        assert!(matches!(
            f.scheduler.stop(Some("deadbeef")).await,
            Err(SchedulerError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn supplied_logs_unblock_session() {
        let f = fixture(MockAgent::new(), |c| c.escalation.max_attempts_per_check = 1);
        f.hosting.push_checks(summary(CheckState::Failing));
        let id = f.scheduler.start_watching("acme/widgets#42").await.unwrap();

        wait_until("awaiting user", || {
            status_of(&f, &id) == Some(SessionStatus::AwaitingUser)
        })
        .await;
        assert_eq!(f.agent.calls().len(), 1);

        f.scheduler
            .provide_logs(&id, "error[E0308]: mismatched types")
            .await
            .unwrap();
        wait_until("second attempt", || f.agent.calls().len() == 2).await;
        assert!(f.agent.calls()[1].prompt.contains("mismatched types"));
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn stopping_all_kills_agent_holder() {
        let f = fixture(MockAgent::new(), |_| {});
        f.hosting.push_checks(summary(CheckState::Pending));
        let id = f.scheduler.start_watching("acme/widgets#42").await.unwrap();

        let ws = f
            .git
            .workspace_path(&RepoSlug::new("acme", "widgets"), WorkspaceKey::Pr(42));
        f.agent.occupy(&ws);

        let stopped = f.scheduler.stop(None).await.unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].session_id, id);
        assert!(stopped[0].killed_agent);
        assert!(f.scheduler.status().is_empty());
    }
}
