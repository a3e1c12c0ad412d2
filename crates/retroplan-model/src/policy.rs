//! Policy configuration
//!
//! Every threshold the controller, escalation router, retrospect runner and
//! planner consult lives here. A policy is plain data: load it from YAML,
//! TOML or JSON, validate it once, then share it behind an `Arc`.

use crate::brief::Budget;
use crate::decision::{EscalationTrigger, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Policy load and validation errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML policy: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML policy: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON policy: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported policy file extension: {0}")]
    UnsupportedFormat(String),

    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Retry limits and backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries per step after the first attempt
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before the given (1-based) retry
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> u64 {
        let exp = retry.saturating_sub(1).min(32);
        self.base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms)
    }
}

/// Integrity drift tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftPolicy {
    /// Maximum acceptable drift, in [0, 1]
    pub tolerance: f64,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self { tolerance: 0.25 }
    }
}

/// Minimum agent confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidencePolicy {
    pub min_confidence: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
        }
    }
}

/// Deadlines, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub step_ms: u64,
    pub retrospect_ms: u64,
    pub escalation_ms: u64,
    /// How long a run may wait in `pending_verification` for retrospects
    pub promotion_wait_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            step_ms: 30_000,
            retrospect_ms: 60_000,
            escalation_ms: 5_000,
            promotion_wait_ms: 30_000,
        }
    }
}

/// Severity mapping and the thresholds that stop execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    pub rules: BTreeMap<EscalationTrigger, Severity>,
    /// Severity for triggers without a rule
    pub default_severity: Severity,
    /// At or above this severity the run pauses
    pub pause_at: Severity,
    /// At or above this severity the run halts until acknowledged
    pub halt_at: Severity,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        use EscalationTrigger as T;
        let rules = BTreeMap::from([
            (T::CapabilityMissing, Severity::S3),
            (T::BudgetExceeded, Severity::S3),
            (T::RetriesExhausted, Severity::S3),
            (T::DriftExceeded, Severity::S3),
            (T::GateTripped, Severity::S4),
            (T::ContractViolation, Severity::S3),
            (T::LowConfidence, Severity::S2),
            (T::ReplanLimit, Severity::S3),
            (T::AcceptanceFailed, Severity::S3),
            (T::RetrospectFailed, Severity::S2),
            (T::CompensationFailed, Severity::S4),
        ]);
        Self {
            rules,
            default_severity: Severity::S3,
            pause_at: Severity::S3,
            halt_at: Severity::S4,
        }
    }
}

/// Retrospect runner limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrospectPolicy {
    pub max_concurrent: usize,
}

impl Default for RetrospectPolicy {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Replanning limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanPolicy {
    pub max_replans: u32,
    /// Replan after retries and alternates are exhausted
    pub replan_on_failure: bool,
}

impl Default for ReplanPolicy {
    fn default() -> Self {
        Self {
            max_replans: 3,
            replan_on_failure: true,
        }
    }
}

/// Planner limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerPolicy {
    pub max_candidates: usize,
    /// Candidates below this feasibility are discarded
    pub min_feasibility: f64,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            max_candidates: 3,
            min_feasibility: 0.0,
        }
    }
}

/// The full policy document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub retry: RetryPolicy,
    pub drift: DriftPolicy,
    /// Global caps, combined with each brief's constraints
    pub budget: Budget,
    pub confidence: ConfidencePolicy,
    pub timeouts: TimeoutPolicy,
    pub escalation: EscalationPolicy,
    pub retrospect: RetrospectPolicy,
    pub replan: ReplanPolicy,
    pub planner: PlannerPolicy,
}

impl PolicyConfig {
    /// Parse a YAML document
    ///
    /// # Errors
    /// Returns error if the YAML is malformed or the policy is invalid
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_yaml::from_str(yaml)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse a TOML document
    ///
    /// # Errors
    /// Returns error if the TOML is malformed or the policy is invalid
    pub fn from_toml_str(text: &str) -> Result<Self, PolicyError> {
        let policy: Self = toml::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse a JSON document
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or the policy is invalid
    pub fn from_json_str(json: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy file, choosing the format by extension
    ///
    /// # Errors
    /// Returns error if the file cannot be read, has an unknown extension,
    /// or does not parse into a valid policy
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&text),
            "toml" => Self::from_toml_str(&text),
            "json" => Self::from_json_str(&text),
            other => Err(PolicyError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Reject thresholds that make no sense
    ///
    /// # Errors
    /// Returns [`PolicyError::Invalid`] naming the offending field
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |msg: &str| Err(PolicyError::Invalid(msg.to_string()));
        if !(0.0..=1.0).contains(&self.drift.tolerance) {
            return invalid("drift.tolerance must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.confidence.min_confidence) {
            return invalid("confidence.min_confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.planner.min_feasibility) {
            return invalid("planner.min_feasibility must be within [0, 1]");
        }
        if self.retrospect.max_concurrent == 0 {
            return invalid("retrospect.max_concurrent must be at least 1");
        }
        if self.planner.max_candidates == 0 {
            return invalid("planner.max_candidates must be at least 1");
        }
        if self.escalation.halt_at < self.escalation.pause_at {
            return invalid("escalation.halt_at must not be below escalation.pause_at");
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return invalid("retry.max_backoff_ms must not be below retry.base_backoff_ms");
        }
        if self.timeouts.step_ms == 0 || self.timeouts.retrospect_ms == 0 {
            return invalid("timeouts must be positive");
        }
        if self.budget.max_cost.is_some_and(|c| c < 0.0) {
            return invalid("budget.max_cost must not be negative");
        }
        Ok(())
    }

    /// Severity the policy assigns to `trigger`
    #[must_use]
    pub fn severity_for(&self, trigger: EscalationTrigger) -> Severity {
        self.escalation
            .rules
            .get(&trigger)
            .copied()
            .unwrap_or(self.escalation.default_severity)
    }

    /// Whether `severity` pauses the run
    #[inline]
    #[must_use]
    pub fn pauses(&self, severity: Severity) -> bool {
        severity >= self.escalation.pause_at
    }

    /// Whether `severity` halts the run pending acknowledgement
    #[inline]
    #[must_use]
    pub fn halts(&self, severity: Severity) -> bool {
        severity >= self.escalation.halt_at
    }

    /// Brief constraints tightened by the global caps
    #[must_use]
    pub fn effective_budget(&self, constraints: Budget) -> Budget {
        constraints.tighten(self.budget)
    }

    /// Retry limit for a step, honouring a per-contract override
    #[must_use]
    pub fn max_retries_for(&self, contract_override: Option<u32>) -> u32 {
        contract_override.unwrap_or(self.retry.max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let policy = PolicyConfig::default();
        policy.validate().unwrap();
        assert_eq!(policy.severity_for(EscalationTrigger::GateTripped), Severity::S4);
        assert_eq!(policy.severity_for(EscalationTrigger::BudgetExceeded), Severity::S3);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let policy = PolicyConfig::from_yaml_str(
            "drift:\n  tolerance: 0.1\nescalation:\n  rules:\n    drift_exceeded: S2\n",
        )
        .unwrap();
        assert!((policy.drift.tolerance - 0.1).abs() < f64::EPSILON);
        assert_eq!(policy.retry.max_retries, 2);
        assert_eq!(policy.severity_for(EscalationTrigger::DriftExceeded), Severity::S2);
        // rules replaces the whole map, unmapped triggers fall back
        assert_eq!(policy.severity_for(EscalationTrigger::GateTripped), Severity::S3);
    }

    #[test]
    fn toml_overrides() {
        let policy = PolicyConfig::from_toml_str(
            "[retry]\nmax_retries = 5\n\n[budget]\nmax_cost = 10.0\n",
        )
        .unwrap();
        assert_eq!(policy.retry.max_retries, 5);
        assert_eq!(policy.budget.max_cost, Some(10.0));
    }

    #[test]
    fn rejects_out_of_range_tolerance() {
        let err = PolicyConfig::from_yaml_str("drift:\n  tolerance: 1.5\n").unwrap_err();
        assert!(matches!(err, PolicyError::Invalid(_)));
    }

    #[test]
    fn rejects_halt_below_pause() {
        let mut policy = PolicyConfig::default();
        policy.escalation.halt_at = Severity::S2;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn loads_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"replan": {{"max_replans": 1}}}}"#).unwrap();
        let policy = PolicyConfig::from_path(&path).unwrap();
        assert_eq!(policy.replan.max_replans, 1);

        let bad = dir.path().join("policy.ini");
        std::fs::write(&bad, "x=1").unwrap();
        assert!(matches!(
            PolicyConfig::from_path(&bad),
            Err(PolicyError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_for(1), 100);
        assert_eq!(retry.backoff_for(2), 200);
        assert_eq!(retry.backoff_for(20), 5_000);
    }

    #[test]
    fn global_caps_tighten_brief() {
        let mut policy = PolicyConfig::default();
        policy.budget.max_cost = Some(5.0);
        let budget = policy.effective_budget(Budget {
            max_cost: Some(8.0),
            max_latency_ms: Some(100),
            max_retries: None,
        });
        assert_eq!(budget.max_cost, Some(5.0));
        assert_eq!(budget.max_latency_ms, Some(100));
    }
}
