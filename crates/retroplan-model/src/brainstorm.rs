//! Planner intermediate results: candidate approaches and capability checks

use crate::contract::ActionContract;
use crate::ids::{CapabilityId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One high-level approach considered before committing to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    /// Estimated probability of success, in [0, 1]
    pub feasibility: f64,
    pub steps: Vec<ActionContract>,
    #[serde(default)]
    pub dependencies: BTreeMap<StepId, Vec<StepId>>,
}

impl Candidate {
    /// Create a candidate with no steps
    #[must_use]
    pub fn new(name: impl Into<String>, feasibility: f64) -> Self {
        Self {
            name: name.into(),
            summary: String::new(),
            feasibility,
            steps: Vec::new(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Append a step with its dependencies
    #[must_use]
    pub fn step(mut self, step: ActionContract, depends_on: &[&str]) -> Self {
        if !depends_on.is_empty() {
            self.dependencies.insert(
                step.id.clone(),
                depends_on.iter().map(|d| StepId::new(*d)).collect(),
            );
        }
        self.steps.push(step);
        self
    }

    /// Every capability any step may invoke
    #[must_use]
    pub fn capabilities(&self) -> BTreeSet<CapabilityId> {
        self.steps.iter().flat_map(ActionContract::capabilities).collect()
    }
}

/// The set of candidates a planner considered, best first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrainstormResult {
    pub candidates: Vec<Candidate>,
}

impl BrainstormResult {
    /// Sort candidates by descending feasibility (stable)
    #[must_use]
    pub fn ranked(mut candidates: Vec<Candidate>) -> Self {
        candidates.sort_by(|a, b| b.feasibility.total_cmp(&a.feasibility));
        Self { candidates }
    }

    /// The most feasible candidate
    #[must_use]
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// Declared kind of a registered capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Agent,
    Tool,
}

/// Availability of one referenced capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub capability: CapabilityId,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CapabilityKind>,
}

/// Availability of every capability a candidate references
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityVerification {
    pub candidate: String,
    pub checks: Vec<CapabilityCheck>,
}

impl CapabilityVerification {
    /// Capabilities that are not registered
    #[must_use]
    pub fn missing(&self) -> Vec<CapabilityId> {
        self.checks
            .iter()
            .filter(|c| !c.available)
            .map(|c| c.capability.clone())
            .collect()
    }

    /// Every capability is available
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.checks.iter().all(|c| c.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_puts_most_feasible_first() {
        let result = BrainstormResult::ranked(vec![
            Candidate::new("slow", 0.4),
            Candidate::new("fast", 0.9),
            Candidate::new("mid", 0.6),
        ]);
        assert_eq!(result.best().unwrap().name, "fast");
    }

    #[test]
    fn verification_lists_missing() {
        let v = CapabilityVerification {
            candidate: "c".into(),
            checks: vec![
                CapabilityCheck {
                    capability: "a".into(),
                    available: true,
                    kind: Some(CapabilityKind::Tool),
                },
                CapabilityCheck {
                    capability: "b".into(),
                    available: false,
                    kind: None,
                },
            ],
        };
        assert!(!v.is_complete());
        assert_eq!(v.missing(), vec![CapabilityId::new("b")]);
    }
}
