use crate::hosting::{
    CheckDetail, CheckSummary, HostingApi, HostingError, PrInfo, PrRef, RepoSlug,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Scripted hosting API for tests.
///
/// `check_results` pops queued summaries in order; the last one is sticky, so
/// a polling loop keeps seeing the final state.
#[derive(Default)]
pub struct MockHosting {
    prs: Mutex<HashMap<u64, PrInfo>>,
    checks: Mutex<VecDeque<CheckSummary>>,
    details: Mutex<HashMap<u64, CheckDetail>>,
    check_calls: Mutex<Vec<String>>,
}

impl MockHosting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pr(&self, number: u64, info: PrInfo) {
        lock(&self.prs).insert(number, info);
    }

    /// Move the reported head of a PR, as if someone pushed.
    pub fn set_head(&self, number: u64, sha: &str) {
        if let Some(info) = lock(&self.prs).get_mut(&number) {
            info.head_sha = sha.to_string();
        }
    }

    pub fn push_checks(&self, summary: CheckSummary) {
        lock(&self.checks).push_back(summary);
    }

    pub fn set_detail(&self, run_id: u64, detail: CheckDetail) {
        lock(&self.details).insert(run_id, detail);
    }

    /// SHAs passed to `check_results`, in call order.
    pub fn check_calls(&self) -> Vec<String> {
        lock(&self.check_calls).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait::async_trait]
impl HostingApi for MockHosting {
    async fn resolve_pr(&self, pr: &PrRef) -> Result<PrInfo, HostingError> {
        lock(&self.prs)
            .get(&pr.number)
            .cloned()
            .ok_or_else(|| HostingError::NotFound(pr.to_string()))
    }

    async fn check_results(
        &self,
        _repo: &RepoSlug,
        sha: &str,
    ) -> Result<CheckSummary, HostingError> {
        lock(&self.check_calls).push(sha.to_string());
        let mut queue = lock(&self.checks);
        let summary = if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        };
        Ok(summary)
    }

    async fn check_run_detail(
        &self,
        _repo: &RepoSlug,
        run_id: u64,
    ) -> Result<CheckDetail, HostingError> {
        lock(&self.details)
            .get(&run_id)
            .cloned()
            .ok_or_else(|| HostingError::NotFound(format!("check run {run_id}")))
    }
}
