//! Normalized step results and the reports attached to them

use crate::brief::BudgetDimension;
use crate::ids::{CapabilityId, StepId, TraceId};
use crate::Outputs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why a step attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The capability reported an error
    Capability,
    /// The deadline expired
    Timeout,
    /// The attempt was cancelled by an invalidation
    Cancelled,
    /// Preconditions were unmet; the capability was not invoked
    Precondition,
    /// The capability answered with an unusable cost or confidence
    InvalidResponse,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Capability => "capability",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Precondition => "precondition",
            Self::InvalidResponse => "invalid response",
        };
        f.write_str(s)
    }
}

/// Failure detail carried by an unsuccessful observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationError {
    pub kind: FailureKind,
    pub message: String,
    /// Whether the capability considers a retry worthwhile
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl ObservationError {
    /// Create an error of the given kind
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    /// Mark as not worth retrying
    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Category of a contract violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    Precondition,
    Postcondition,
    MissingOutput,
    Budget { dimension: BudgetDimension },
    Policy,
}

/// One violated contract clause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractViolation {
    #[serde(flatten)]
    pub kind: ViolationKind,
    pub detail: String,
}

impl ContractViolation {
    /// Create a violation
    #[must_use]
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Structured result of a contract check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractReport {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<ContractViolation>,
}

impl ContractReport {
    /// No violations
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Any violation of a matching kind
    #[must_use]
    pub fn any(&self, pred: impl Fn(&ViolationKind) -> bool) -> bool {
        self.violations.iter().any(|v| pred(&v.kind))
    }

    /// First budget dimension violated, if any
    #[must_use]
    pub fn budget_violation(&self) -> Option<BudgetDimension> {
        self.violations.iter().find_map(|v| match v.kind {
            ViolationKind::Budget { dimension } => Some(dimension),
            _ => None,
        })
    }

    /// Merge another report into this one
    pub fn merge(&mut self, other: ContractReport) {
        self.violations.extend(other.violations);
    }
}

/// Result of one named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    /// Passing result
    #[must_use]
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: None,
        }
    }

    /// Failing result
    #[must_use]
    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// Verifier output for one observation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    #[serde(default)]
    pub acceptance: Vec<CheckResult>,
    #[serde(default)]
    pub gates: Vec<CheckResult>,
    /// Fraction of declared expectations the observation missed, in [0, 1]
    pub drift: f64,
    /// Policy tolerance the drift was judged against
    pub tolerance: f64,
}

impl VerificationReport {
    /// A hard-stop gate failed
    #[must_use]
    pub fn gate_tripped(&self) -> bool {
        self.gates.iter().any(|g| !g.passed)
    }

    /// Drift is above tolerance
    #[must_use]
    pub fn drift_exceeded(&self) -> bool {
        self.drift > self.tolerance
    }

    /// Names of failed acceptance tests
    #[must_use]
    pub fn failed_acceptance(&self) -> Vec<&str> {
        self.acceptance
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Names of tripped gates
    #[must_use]
    pub fn tripped_gates(&self) -> Vec<&str> {
        self.gates
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// The normalized result of executing one ActionContract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step_id: StepId,
    /// 1-based attempt number for this step
    pub attempt: u32,
    pub capability: CapabilityId,
    #[serde(default)]
    pub capability_version: String,
    pub success: bool,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ObservationError>,
    pub cost: f64,
    pub duration_ms: u64,
    /// Self-reported confidence (agents only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Raw capability response metadata
    #[serde(default)]
    pub raw: Value,
    pub trace_id: TraceId,
    #[serde(default)]
    pub contract: ContractReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
}

impl Observation {
    /// Failed observation with no outputs
    #[must_use]
    pub fn failed(
        step_id: StepId,
        attempt: u32,
        capability: CapabilityId,
        error: ObservationError,
        trace_id: TraceId,
    ) -> Self {
        Self {
            step_id,
            attempt,
            capability,
            capability_version: String::new(),
            success: false,
            outputs: Outputs::new(),
            error: Some(error),
            cost: 0.0,
            duration_ms: 0,
            confidence: None,
            raw: Value::Null,
            trace_id,
            contract: ContractReport::default(),
            verification: None,
        }
    }

    /// The failure kind, if unsuccessful
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Succeeded, met its contract, and passed verification
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.success
            && self.contract.is_clean()
            && self
                .verification
                .as_ref()
                .map_or(true, |v| !v.gate_tripped() && !v.drift_exceeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_flags() {
        let report = VerificationReport {
            acceptance: vec![CheckResult::pass("a"), CheckResult::fail("b", "nope")],
            gates: vec![CheckResult::fail("pii", "phone number")],
            drift: 0.5,
            tolerance: 0.25,
        };
        assert!(report.gate_tripped());
        assert!(report.drift_exceeded());
        assert_eq!(report.failed_acceptance(), vec!["b"]);
        assert_eq!(report.tripped_gates(), vec!["pii"]);
    }

    #[test]
    fn violation_serializes_flat() {
        let v = ContractViolation::new(
            ViolationKind::Budget {
                dimension: BudgetDimension::Cost,
            },
            "cost 3 > 2",
        );
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "budget");
        assert_eq!(json["dimension"], "cost");
        let back: ContractViolation = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn failed_observation_is_not_clean() {
        let obs = Observation::failed(
            StepId::new("s"),
            1,
            CapabilityId::new("c"),
            ObservationError::new(FailureKind::Timeout, "deadline"),
            TraceId::new(),
        );
        assert!(!obs.is_clean());
        assert_eq!(obs.failure_kind(), Some(FailureKind::Timeout));
    }
}
