//! Contract validation
//!
//! Preconditions run before the capability is invoked; postconditions,
//! declared outputs, budget and policy checks run on the observation.
//! Every problem becomes a [`ContractViolation`] in a report.

use retroplan_model::{
    ActionContract, Budget, ContractReport, ContractViolation, Observation, PolicyConfig, Scope,
    Spend, ViolationKind,
};
use std::sync::Arc;

/// Checks declared contract clauses against observed facts
#[derive(Debug, Clone)]
pub struct ContractValidator {
    policy: Arc<PolicyConfig>,
}

impl ContractValidator {
    #[must_use]
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self { policy }
    }

    /// Evaluate preconditions over the bound values
    #[must_use]
    pub fn check_preconditions(&self, contract: &ActionContract, scope: &Scope<'_>) -> ContractReport {
        let violations = contract
            .preconditions
            .iter()
            .filter_map(|assertion| assertion.check(scope).err())
            .map(|failure| ContractViolation::new(ViolationKind::Precondition, failure.detail))
            .collect();
        ContractReport { violations }
    }

    /// Evaluate outputs, postconditions, budget and policy after execution
    ///
    /// `spend` is the run's spend including this observation.
    #[must_use]
    pub fn check_postconditions(
        &self,
        contract: &ActionContract,
        observation: &Observation,
        scope: &Scope<'_>,
        budget: &Budget,
        spend: &Spend,
    ) -> ContractReport {
        let mut report = ContractReport::default();

        if let Some(dimension) = budget.exceeded_by(spend) {
            report.violations.push(ContractViolation::new(
                ViolationKind::Budget { dimension },
                format!("run {dimension} budget exceeded"),
            ));
        }

        if !observation.success {
            return report;
        }

        let local = scope.with_local(&observation.outputs);
        for key in &contract.outputs {
            if !observation.outputs.contains_key(key) {
                report.violations.push(ContractViolation::new(
                    ViolationKind::MissingOutput,
                    format!("declared output `{key}` was not produced"),
                ));
            }
        }
        for assertion in &contract.postconditions {
            if let Err(failure) = assertion.check(&local) {
                report
                    .violations
                    .push(ContractViolation::new(ViolationKind::Postcondition, failure.detail));
            }
        }
        if let Some(confidence) = observation.confidence {
            if confidence < self.policy.confidence.min_confidence {
                report.violations.push(ContractViolation::new(
                    ViolationKind::Policy,
                    format!(
                        "confidence {confidence:.2} below minimum {:.2}",
                        self.policy.confidence.min_confidence
                    ),
                ));
            }
        }
        report
    }
}
