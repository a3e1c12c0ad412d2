//! Controller decisions and escalation severities

use crate::ids::{CapabilityId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Escalation severity, informational (S1) through execution-halting (S4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    S1,
    S2,
    S3,
    S4,
}

impl Severity {
    /// Numeric level (1-4)
    #[inline]
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::S1 => 1,
            Self::S2 => 2,
            Self::S3 => 3,
            Self::S4 => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.level())
    }
}

/// What caused an escalation; keys the policy severity mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    CapabilityMissing,
    BudgetExceeded,
    RetriesExhausted,
    DriftExceeded,
    GateTripped,
    ContractViolation,
    LowConfidence,
    ReplanLimit,
    AcceptanceFailed,
    RetrospectFailed,
    CompensationFailed,
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CapabilityMissing => "capability_missing",
            Self::BudgetExceeded => "budget_exceeded",
            Self::RetriesExhausted => "retries_exhausted",
            Self::DriftExceeded => "drift_exceeded",
            Self::GateTripped => "gate_tripped",
            Self::ContractViolation => "contract_violation",
            Self::LowConfidence => "low_confidence",
            Self::ReplanLimit => "replan_limit",
            Self::AcceptanceFailed => "acceptance_failed",
            Self::RetrospectFailed => "retrospect_failed",
            Self::CompensationFailed => "compensation_failed",
        };
        f.write_str(s)
    }
}

/// The controller's verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Accept the observation and advance
    Continue,
    /// Re-run the same contract
    Retry { attempt: u32, backoff_ms: u64 },
    /// Replace the step with its next alternate
    Alternate { capability: CapabilityId },
    /// Ask the planner for a patch
    Replan { hint: String },
    /// Hand off to the escalation router
    Escalate {
        trigger: EscalationTrigger,
        severity: Severity,
    },
}

impl Verdict {
    /// Short name for logs and metrics
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Retry { .. } => "retry",
            Self::Alternate { .. } => "alternate",
            Self::Replan { .. } => "replan",
            Self::Escalate { .. } => "escalate",
        }
    }
}

/// A verdict plus its rationale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub step_id: StepId,
    pub attempt: u32,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub rationale: String,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// Create a decision timestamped now
    #[must_use]
    pub fn new(step_id: StepId, attempt: u32, verdict: Verdict, rationale: impl Into<String>) -> Self {
        Self {
            step_id,
            attempt,
            verdict,
            rationale: rationale.into(),
            decided_at: Utc::now(),
        }
    }

    /// Whether this is an escalation
    #[must_use]
    pub fn is_escalation(&self) -> bool {
        matches!(self.verdict, Verdict::Escalate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_order_by_level() {
        assert!(Severity::S4 > Severity::S3);
        assert_eq!(Severity::S2.to_string(), "S2");
    }

    #[test]
    fn decision_flattens_verdict() {
        let d = Decision::new(
            StepId::new("s"),
            2,
            Verdict::Escalate {
                trigger: EscalationTrigger::DriftExceeded,
                severity: Severity::S3,
            },
            "drift 0.6 > 0.25",
        );
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["verdict"], "escalate");
        assert_eq!(json["trigger"], "drift_exceeded");
        assert!(d.is_escalation());
    }
}
