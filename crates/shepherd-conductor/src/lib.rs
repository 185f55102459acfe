//! Automated CI remediation for pull requests.
//!
//! A [`scheduler::Scheduler`] owns a set of watch sessions, one per pull
//! request. Each session polls CI through a [`hosting::HostingApi`], turns a
//! failing check into a [`failure::FailureInfo`], picks a fix strategy from the
//! escalation ladder, and hands the work to the single shared coding agent
//! ([`agent::AgentController`]). Once CI is green the session's commits can be
//! squashed into one and force-pushed.

pub mod agent;
pub mod config;
pub mod failure;
pub mod git;
pub mod hosting;
pub mod runner;
pub mod scheduler;
pub mod session;

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
