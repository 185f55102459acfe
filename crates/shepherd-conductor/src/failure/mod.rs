//! Turning a failing check into a fix plan.

pub mod escalation;
pub mod extract;
pub mod prompt;
pub mod redact;

pub use escalation::{decide, strategy_for, AwaitReason, Decision, Strategy};
pub use extract::extract_failure;

use crate::hosting::{Annotation, CheckKind};
use serde::{Deserialize, Serialize};

/// One detected failing check. Escalation is keyed by `check_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub check_name: String,
    pub check_type: CheckKind,
    pub check_url: String,
    pub app: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_steps: Vec<String>,
    /// User-supplied log text, already masked and truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
}

impl FailureInfo {
    pub fn has_detail(&self) -> bool {
        !self.annotations.is_empty() || !self.failed_steps.is_empty()
    }
}
