use crate::config::EscalationConfig;
use crate::failure::FailureInfo;
use crate::hosting::{CheckEntry, CheckKind, CheckState, CheckSummary, HostingApi, RepoSlug};
use tracing::warn;

/// First failing check, check runs before legacy statuses.
pub fn first_failure(summary: &CheckSummary) -> Option<&CheckEntry> {
    summary
        .checks
        .iter()
        .filter(|c| c.state == CheckState::Failing)
        .min_by_key(|c| c.kind != CheckKind::CheckRun)
}

/// Build a [`FailureInfo`] for the first failing check, enriched with
/// annotations and failed steps when its integration exposes them.
/// Enrichment errors degrade to name and URL.
pub async fn extract_failure(
    hosting: &dyn HostingApi,
    repo: &RepoSlug,
    summary: &CheckSummary,
    config: &EscalationConfig,
) -> Option<FailureInfo> {
    let check = first_failure(summary)?;
    let mut info = FailureInfo {
        check_name: check.name.clone(),
        check_type: check.kind,
        check_url: check.url.clone(),
        app: check.app.clone(),
        annotations: Vec::new(),
        failed_steps: Vec::new(),
        logs: None,
        run_id: check.run_id,
    };

    if let (true, Some(run_id)) = (config.is_structured(&check.app), check.run_id) {
        match hosting.check_run_detail(repo, run_id).await {
            Ok(detail) => {
                info.annotations = detail.annotations;
                info.failed_steps = detail.failed_steps;
            }
            Err(e) => {
                warn!(check = %check.name, run_id, error = %e, "could not fetch check detail");
            }
        }
    }
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosting::mock::MockHosting;
    use crate::hosting::{Annotation, CheckDetail};

    fn entry(name: &str, kind: CheckKind, state: CheckState, app: &str, run_id: Option<u64>) -> CheckEntry {
        CheckEntry {
            name: name.into(),
            kind,
            state,
            url: format!("https://ci/{name}"),
            app: app.into(),
            run_id,
        }
    }

    fn repo() -> RepoSlug {
        RepoSlug::new("acme", "widgets")
    }

    #[test]
    fn check_runs_come_first() {
        let summary = CheckSummary {
            checks: vec![
                entry("jenkins", CheckKind::LegacyStatus, CheckState::Failing, "jenkins", None),
                entry("lint", CheckKind::CheckRun, CheckState::Passing, "github-actions", Some(1)),
                entry("unit-tests", CheckKind::CheckRun, CheckState::Failing, "github-actions", Some(2)),
            ],
        };
        assert_eq!(first_failure(&summary).unwrap().name, "unit-tests");
    }

    #[tokio::test]
    async fn structured_check_is_enriched() {
        let hosting = MockHosting::new();
        hosting.set_detail(
            2,
            CheckDetail {
                annotations: vec![
                    Annotation { path: "src/a.rs".into(), line: Some(3), message: "boom".into() },
                    Annotation { path: "src/b.rs".into(), line: None, message: "bang".into() },
                ],
                failed_steps: vec!["test / cargo test".into()],
            },
        );
        let summary = CheckSummary {
            checks: vec![entry("unit-tests", CheckKind::CheckRun, CheckState::Failing, "github-actions", Some(2))],
        };
        let info = extract_failure(&hosting, &repo(), &summary, &EscalationConfig::default())
            .await
            .unwrap();
        assert_eq!(info.check_name, "unit-tests");
        assert_eq!(info.annotations.len(), 2);
        assert_eq!(info.failed_steps, vec!["test / cargo test"]);
        assert!(info.has_detail());
    }

    #[tokio::test]
    async fn opaque_check_has_name_and_url_only() {
        let hosting = MockHosting::new();
        hosting.set_detail(5, CheckDetail { annotations: vec![], failed_steps: vec!["x".into()] });
        let summary = CheckSummary {
            checks: vec![entry("ci/jenkins", CheckKind::CheckRun, CheckState::Failing, "jenkins", Some(5))],
        };
        let info = extract_failure(&hosting, &repo(), &summary, &EscalationConfig::default())
            .await
            .unwrap();
        assert_eq!(info.check_url, "https://ci/ci/jenkins");
        assert!(!info.has_detail());
    }

    #[tokio::test]
    async fn detail_error_degrades() {
        let hosting = MockHosting::new();
        let summary = CheckSummary {
            checks: vec![entry("unit-tests", CheckKind::CheckRun, CheckState::Failing, "github-actions", Some(99))],
        };
        let info = extract_failure(&hosting, &repo(), &summary, &EscalationConfig::default())
            .await
            .unwrap();
        assert!(!info.has_detail());
    }

    #[tokio::test]
    async fn no_failure_is_none() {
        let hosting = MockHosting::new();
        let summary = CheckSummary {
            checks: vec![entry("lint", CheckKind::CheckRun, CheckState::Pending, "github-actions", Some(1))],
        };
        assert!(extract_failure(&hosting, &repo(), &summary, &EscalationConfig::default())
            .await
            .is_none());
    }
}
