//! Acceptance tests, gates and integrity drift
//!
//! Drift is the fraction of declared expectations an observation missed:
//! declared output keys, postconditions and step acceptance tests each
//! count as one expectation. A step that declares nothing has zero drift.

use retroplan_model::{
    ActionContract, Check, CheckResult, Observation, Outputs, PolicyConfig, Scope, StepId,
    TaskBrief, VerificationReport,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs acceptance tests and gates, and scores drift
#[derive(Debug, Clone)]
pub struct Verifier {
    policy: Arc<PolicyConfig>,
}

fn run_checks<'c>(
    checks: impl IntoIterator<Item = &'c Check>,
    scope: &Scope<'_>,
) -> Vec<CheckResult> {
    checks
        .into_iter()
        .map(|check| match check.assertion.check(scope) {
            Ok(()) => CheckResult::pass(&check.name),
            Err(failure) => CheckResult::fail(&check.name, failure.detail),
        })
        .collect()
}

impl Verifier {
    #[must_use]
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self { policy }
    }

    /// Verify one successful observation
    ///
    /// Gates come from both the brief and the step. Failed observations
    /// have nothing to verify and yield `None`.
    #[must_use]
    pub fn verify(
        &self,
        brief: &TaskBrief,
        contract: &ActionContract,
        observation: &Observation,
        scope: &Scope<'_>,
    ) -> Option<VerificationReport> {
        if !observation.success {
            return None;
        }
        let local = scope.with_local(&observation.outputs);
        let acceptance = run_checks(&contract.acceptance, &local);
        let gates = run_checks(brief.gates.iter().chain(&contract.gates), &local);

        let missing_outputs = contract
            .outputs
            .iter()
            .filter(|key| !observation.outputs.contains_key(*key))
            .count();
        let failed_post = contract
            .postconditions
            .iter()
            .filter(|a| a.check(&local).is_err())
            .count();
        let failed_acceptance = acceptance.iter().filter(|c| !c.passed).count();
        let expectations =
            contract.outputs.len() + contract.postconditions.len() + contract.acceptance.len();
        let missed = missing_outputs + failed_post + failed_acceptance;

        Some(VerificationReport {
            acceptance,
            gates,
            drift: drift(missed, expectations),
            tolerance: self.policy.drift.tolerance,
        })
    }

    /// Final outputs of a run: every step's outputs merged in plan order
    #[must_use]
    pub fn final_outputs(order: &[StepId], outputs: &BTreeMap<StepId, Outputs>) -> Outputs {
        let mut merged = Outputs::new();
        for step in order {
            if let Some(values) = outputs.get(step) {
                merged.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged
    }

    /// Brief acceptance tests and required output shapes over the final result
    #[must_use]
    pub fn verify_final(
        &self,
        brief: &TaskBrief,
        steps: &BTreeMap<StepId, Outputs>,
        result: &Outputs,
    ) -> Vec<CheckResult> {
        let scope = Scope::new(&brief.inputs, steps).with_local(result);
        let mut results = run_checks(&brief.acceptance_tests, &scope);
        for (key, ty) in &brief.required_outputs {
            let name = format!("required output `{key}`");
            results.push(match scope.lookup(key) {
                Some(value) if ty.matches(value) => CheckResult::pass(name),
                Some(value) => CheckResult::fail(name, format!("expected {ty:?}, found {value}")),
                None => CheckResult::fail(name, "missing"),
            });
        }
        results
    }
}

#[allow(clippy::cast_precision_loss)]
fn drift(missed: usize, expectations: usize) -> f64 {
    if expectations == 0 {
        0.0
    } else {
        missed as f64 / expectations as f64
    }
}
