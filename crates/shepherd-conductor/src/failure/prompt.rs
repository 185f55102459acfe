use crate::failure::FailureInfo;
use crate::hosting::Annotation;
use std::fmt::Write;

const CLOSING: &str = "Fix the failure, run the relevant checks locally if you can, and commit \
the fix with a descriptive message. Do not ask for confirmation. Do not push; the branch is \
pushed for you after you finish.";

fn annotation_line(a: &Annotation) -> String {
    match a.line {
        Some(line) => format!("- {}:{line}: {}", a.path, a.message.trim()),
        None => format!("- {}: {}", a.path, a.message.trim()),
    }
}

/// Short mechanical prompt: check name, failed steps, first `annotation_limit` annotations.
pub fn templated(failure: &FailureInfo, branch: &str, annotation_limit: usize) -> String {
    let mut p = String::new();
    let _ = writeln!(
        p,
        "The CI check \"{}\" is failing on branch `{branch}`.",
        failure.check_name
    );
    if !failure.failed_steps.is_empty() {
        p.push_str("\nFailed steps:\n");
        for step in &failure.failed_steps {
            let _ = writeln!(p, "- {step}");
        }
    }
    if !failure.annotations.is_empty() {
        let shown = failure.annotations.len().min(annotation_limit);
        let _ = writeln!(
            p,
            "\nAnnotations ({shown} of {}):",
            failure.annotations.len()
        );
        for a in failure.annotations.iter().take(annotation_limit) {
            let _ = writeln!(p, "{}", annotation_line(a));
        }
    }
    if !failure.check_url.is_empty() {
        let _ = writeln!(p, "\nDetails: {}", failure.check_url);
    }
    let _ = write!(p, "\n{CLOSING}");
    p
}

/// Richer prompt for later attempts: every annotation plus any user logs.
pub fn deep_analysis(failure: &FailureInfo, branch: &str, previous_attempts: u32) -> String {
    let mut p = String::new();
    let _ = writeln!(
        p,
        "The CI check \"{}\" ({}) is still failing on branch `{branch}` after {previous_attempts} \
         previous fix attempt(s).",
        failure.check_name, failure.app
    );
    p.push_str(
        "Earlier fixes did not address the root cause. Read the failure detail below \
         carefully, reproduce it locally where possible, and reconsider assumptions made \
         by the previous attempts.\n",
    );
    if !failure.failed_steps.is_empty() {
        p.push_str("\nFailed steps:\n");
        for step in &failure.failed_steps {
            let _ = writeln!(p, "- {step}");
        }
    }
    if !failure.annotations.is_empty() {
        p.push_str("\nAll annotations:\n");
        for a in &failure.annotations {
            let _ = writeln!(p, "{}", annotation_line(a));
        }
    }
    if let Some(logs) = failure.logs.as_deref() {
        let _ = writeln!(p, "\nCI log output supplied by the user:\n```\n{}\n```", logs.trim_end());
    }
    if !failure.check_url.is_empty() {
        let _ = writeln!(p, "\nDetails: {}", failure.check_url);
    }
    let _ = write!(p, "\n{CLOSING}");
    p
}
