use crate::config::EscalationConfig;
use crate::failure::FailureInfo;
use serde::{Deserialize, Serialize};

/// Fix strategy tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Templated,
    DeepAnalysis,
    ManualRequired,
}

/// Tier for a 1-based per-check attempt number.
///
/// Attempt 1 is templated, attempt 2 is deep analysis. From attempt 3 on, an
/// integration without fetchable logs needs logs from the user first.
pub fn strategy_for(attempt_number: u32, requires_manual_logs: bool, logs_supplied: bool) -> Strategy {
    match attempt_number {
        0 | 1 => Strategy::Templated,
        2 => Strategy::DeepAnalysis,
        _ if requires_manual_logs && !logs_supplied => Strategy::ManualRequired,
        _ => Strategy::DeepAnalysis,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AwaitReason {
    CeilingReached { attempts: u32 },
    LogsRequired,
}

impl std::fmt::Display for AwaitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CeilingReached { attempts } => {
                write!(f, "{attempts} attempts made, provide logs or fix manually")
            }
            Self::LogsRequired => write!(f, "CI exposes no logs, paste the failing job output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Attempt { attempt_number: u32, strategy: Strategy },
    AwaitUser(AwaitReason),
}

/// Next step for `failure` given how many attempts were already recorded for
/// its check. `logs_override` is the one extra attempt granted past the
/// ceiling after the user supplied logs.
pub fn decide(
    prior_attempts: u32,
    failure: &FailureInfo,
    config: &EscalationConfig,
    logs_override: bool,
) -> Decision {
    let attempt_number = prior_attempts + 1;
    if attempt_number > config.max_attempts_per_check && !logs_override {
        return Decision::AwaitUser(AwaitReason::CeilingReached {
            attempts: prior_attempts,
        });
    }
    let requires_manual_logs = !config.is_structured(&failure.app);
    match strategy_for(attempt_number, requires_manual_logs, failure.logs.is_some()) {
        Strategy::ManualRequired => Decision::AwaitUser(AwaitReason::LogsRequired),
        strategy => Decision::Attempt {
            attempt_number,
            strategy,
        },
    }
}
