//! Task briefs and budgets

use crate::assertion::{Check, ValueType};
use crate::Outputs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The immutable description of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    /// What the task should achieve
    pub objective: String,
    /// Named input values, addressable as `input.<key>`
    #[serde(default)]
    pub inputs: Outputs,
    /// Output keys the final result must carry, with their shapes
    #[serde(default)]
    pub required_outputs: BTreeMap<String, ValueType>,
    /// Assertions over the final outputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_tests: Vec<Check>,
    /// Hard-stop assertions applied to every step's outputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<Check>,
    /// Budget limits for the whole run
    #[serde(default)]
    pub constraints: Budget,
}

impl TaskBrief {
    /// Create a brief with no inputs or constraints
    #[must_use]
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            inputs: Outputs::new(),
            required_outputs: BTreeMap::new(),
            acceptance_tests: Vec::new(),
            gates: Vec::new(),
            constraints: Budget::default(),
        }
    }

    /// With an input value
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// With a required output
    #[must_use]
    pub fn with_required_output(mut self, key: impl Into<String>, ty: ValueType) -> Self {
        self.required_outputs.insert(key.into(), ty);
        self
    }

    /// With an acceptance test
    #[must_use]
    pub fn with_acceptance_test(mut self, check: Check) -> Self {
        self.acceptance_tests.push(check);
        self
    }

    /// With a gate
    #[must_use]
    pub fn with_gate(mut self, check: Check) -> Self {
        self.gates.push(check);
        self
    }

    /// With budget constraints
    #[must_use]
    pub fn with_constraints(mut self, constraints: Budget) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Budget limits; `None` means unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Accumulated spend of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Spend {
    pub cost: f64,
    pub latency_ms: u64,
    pub retries: u32,
}

impl Spend {
    /// Spend after adding one more attempt
    ///
    /// A NaN or negative cost adds nothing, so spend never decreases and
    /// never stops comparing against a cap.
    #[must_use]
    pub fn plus(self, cost: f64, latency_ms: u64, retry: bool) -> Self {
        Self {
            cost: self.cost + cost.max(0.0),
            latency_ms: self.latency_ms.saturating_add(latency_ms),
            retries: self.retries + u32::from(retry),
        }
    }
}

/// Budget dimension that was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Cost,
    Latency,
    Retries,
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cost => f.write_str("cost"),
            Self::Latency => f.write_str("latency"),
            Self::Retries => f.write_str("retries"),
        }
    }
}

impl Budget {
    /// Combine two budgets, keeping the tighter limit per dimension
    #[must_use]
    pub fn tighten(self, other: Budget) -> Budget {
        fn tighter<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(if b < a { b } else { a }),
                (a, b) => a.or(b),
            }
        }
        Budget {
            max_cost: tighter(self.max_cost, other.max_cost),
            max_latency_ms: tighter(self.max_latency_ms, other.max_latency_ms),
            max_retries: tighter(self.max_retries, other.max_retries),
        }
    }

    /// First dimension in which `spend` is over the limit
    #[must_use]
    pub fn exceeded_by(&self, spend: &Spend) -> Option<BudgetDimension> {
        if self.max_cost.is_some_and(|max| spend.cost > max) {
            Some(BudgetDimension::Cost)
        } else if self.max_latency_ms.is_some_and(|max| spend.latency_ms > max) {
            Some(BudgetDimension::Latency)
        } else if self.max_retries.is_some_and(|max| spend.retries > max) {
            Some(BudgetDimension::Retries)
        } else {
            None
        }
    }

    /// Remaining headroom after `spend`
    #[must_use]
    pub fn remaining(&self, spend: &Spend) -> Budget {
        Budget {
            max_cost: self.max_cost.map(|max| (max - spend.cost).max(0.0)),
            max_latency_ms: self
                .max_latency_ms
                .map(|max| max.saturating_sub(spend.latency_ms)),
            max_retries: self.max_retries.map(|max| max.saturating_sub(spend.retries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spend_ignores_nan_and_negative_costs() {
        let spend = Spend::default()
            .plus(1.5, 10, false)
            .plus(f64::NAN, 0, false)
            .plus(-100.0, 0, true);
        assert!((spend.cost - 1.5).abs() < f64::EPSILON);
        assert_eq!(spend.retries, 1);
        let cap = Budget {
            max_cost: Some(1.0),
            ..Budget::default()
        };
        assert_eq!(cap.exceeded_by(&spend), Some(BudgetDimension::Cost));
    }

    #[test]
    fn tighten_keeps_smaller_limits() {
        let brief = Budget {
            max_cost: Some(10.0),
            max_latency_ms: None,
            max_retries: Some(5),
        };
        let policy = Budget {
            max_cost: Some(4.0),
            max_latency_ms: Some(1000),
            max_retries: None,
        };
        let merged = brief.tighten(policy);
        assert_eq!(merged.max_cost, Some(4.0));
        assert_eq!(merged.max_latency_ms, Some(1000));
        assert_eq!(merged.max_retries, Some(5));
    }

    #[test]
    fn exceeded_reports_first_dimension() {
        let budget = Budget {
            max_cost: Some(1.0),
            max_latency_ms: Some(100),
            max_retries: None,
        };
        assert_eq!(budget.exceeded_by(&Spend::default()), None);
        let spend = Spend::default().plus(0.5, 150, false);
        assert_eq!(budget.exceeded_by(&spend), Some(BudgetDimension::Latency));
        assert_eq!(budget.remaining(&spend).max_latency_ms, Some(0));
    }

    #[test]
    fn brief_deserializes_with_defaults() {
        let brief: TaskBrief = serde_json::from_str(r#"{"objective": "summarize"}"#).unwrap();
        assert!(brief.inputs.is_empty());
        assert_eq!(brief.constraints, Budget::default());
    }
}
