//! Policy-driven controller
//!
//! [`Controller::decide`] is a pure function of the observation, the step's
//! contract, the run state and the effective budget. Every threshold it
//! compares against comes from [`PolicyConfig`].
//!
//! Precedence, highest first:
//! 1. budget exceeded: escalate
//! 2. gate tripped: escalate
//! 3. unmet preconditions: alternate, replan, escalate
//! 4. capability failure: retry, alternate, replan, escalate
//! 5. drift over tolerance: retry, alternate, escalate (never replans)
//! 6. postcondition or missing output: retry, alternate, replan, escalate
//! 7. low agent confidence: retry, alternate, escalate
//! 8. otherwise continue

use retroplan_model::{
    ActionContract, Budget, Decision, EscalationTrigger, FailureKind, Observation, PolicyConfig,
    RunState, Verdict, ViolationKind,
};
use std::sync::Arc;

/// Decides what to do with each observation
#[derive(Debug, Clone)]
pub struct Controller {
    policy: Arc<PolicyConfig>,
}

/// Which fallbacks a failure class may use after retries
#[derive(Debug, Clone, Copy)]
struct Ladder {
    retry: bool,
    replan: bool,
    exhausted: EscalationTrigger,
}

impl Controller {
    #[must_use]
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Decide on one observation
    ///
    /// `state.spend` must already include the observation's cost and
    /// duration. `budget` is the effective run budget.
    #[must_use]
    pub fn decide(
        &self,
        observation: &Observation,
        contract: &ActionContract,
        state: &RunState,
        budget: &Budget,
    ) -> Decision {
        let over_budget = budget
            .exceeded_by(&state.spend)
            .or_else(|| observation.contract.budget_violation());
        if let Some(dimension) = over_budget {
            return self.escalate(
                observation,
                EscalationTrigger::BudgetExceeded,
                format!("run {dimension} budget exceeded"),
            );
        }

        let verification = observation.verification.as_ref();
        if let Some(report) = verification.filter(|v| v.gate_tripped()) {
            return self.escalate(
                observation,
                EscalationTrigger::GateTripped,
                format!("gate tripped: {}", report.tripped_gates().join(", ")),
            );
        }

        if observation.failure_kind() == Some(FailureKind::Precondition) {
            let detail = observation
                .error
                .as_ref()
                .map_or_else(String::new, |e| e.message.clone());
            return self.fall_back(
                observation,
                contract,
                state,
                budget,
                format!("preconditions unmet: {detail}"),
                Ladder {
                    retry: false,
                    replan: true,
                    exhausted: EscalationTrigger::ContractViolation,
                },
            );
        }

        if !observation.success {
            let (detail, retryable) = observation
                .error
                .as_ref()
                .map_or((String::from("unknown error"), true), |e| {
                    (format!("{}: {}", e.kind, e.message), e.retryable)
                });
            return self.fall_back(
                observation,
                contract,
                state,
                budget,
                format!("execution failed ({detail})"),
                Ladder {
                    retry: retryable,
                    replan: self.policy.replan.replan_on_failure,
                    exhausted: EscalationTrigger::RetriesExhausted,
                },
            );
        }

        if let Some(report) = verification.filter(|v| v.drift_exceeded()) {
            return self.fall_back(
                observation,
                contract,
                state,
                budget,
                format!(
                    "drift {:.2} exceeds tolerance {:.2}",
                    report.drift, report.tolerance
                ),
                Ladder {
                    retry: true,
                    replan: false,
                    exhausted: EscalationTrigger::DriftExceeded,
                },
            );
        }

        let broken = observation
            .contract
            .violations
            .iter()
            .filter(|v| matches!(v.kind, ViolationKind::Postcondition | ViolationKind::MissingOutput))
            .map(|v| v.detail.as_str())
            .collect::<Vec<_>>();
        if !broken.is_empty() {
            return self.fall_back(
                observation,
                contract,
                state,
                budget,
                format!("contract violated: {}", broken.join("; ")),
                Ladder {
                    retry: true,
                    replan: self.policy.replan.replan_on_failure,
                    exhausted: EscalationTrigger::ContractViolation,
                },
            );
        }

        if let Some(confidence) = observation
            .confidence
            .filter(|c| *c < self.policy.confidence.min_confidence)
        {
            return self.fall_back(
                observation,
                contract,
                state,
                budget,
                format!(
                    "confidence {confidence:.2} below minimum {:.2}",
                    self.policy.confidence.min_confidence
                ),
                Ladder {
                    retry: true,
                    replan: false,
                    exhausted: EscalationTrigger::LowConfidence,
                },
            );
        }

        Decision::new(
            observation.step_id.clone(),
            observation.attempt,
            Verdict::Continue,
            "observation met its contract",
        )
    }

    /// Retry, then alternate, then replan, then escalate
    fn fall_back(
        &self,
        observation: &Observation,
        contract: &ActionContract,
        state: &RunState,
        budget: &Budget,
        cause: String,
        ladder: Ladder,
    ) -> Decision {
        let retry_blocked = if ladder.retry {
            self.retry_blocked(observation, contract, state, budget)
        } else {
            Some("not retryable".to_string())
        };
        let Some(blocked) = retry_blocked else {
            let verdict = Verdict::Retry {
                attempt: observation.attempt + 1,
                backoff_ms: self.policy.retry.backoff_for(observation.attempt),
            };
            return self.decision(observation, verdict, cause);
        };

        if let Some(alternate) = contract.next_alternate() {
            let rationale = format!("{cause}; {blocked}; switching to `{}`", alternate.capability);
            return self.decision(
                observation,
                Verdict::Alternate {
                    capability: alternate.capability,
                },
                rationale,
            );
        }

        if ladder.replan {
            if state.replans < self.policy.replan.max_replans {
                let rationale = format!("{cause}; {blocked}; no alternate left");
                return self.decision(observation, Verdict::Replan { hint: cause }, rationale);
            }
            return self.escalate(
                observation,
                EscalationTrigger::ReplanLimit,
                format!(
                    "{cause}; replan limit of {} reached",
                    self.policy.replan.max_replans
                ),
            );
        }

        self.escalate(
            observation,
            ladder.exhausted,
            format!("{cause}; {blocked}; no alternate left"),
        )
    }

    /// Why another attempt is not allowed, if it is not
    fn retry_blocked(
        &self,
        observation: &Observation,
        contract: &ActionContract,
        state: &RunState,
        budget: &Budget,
    ) -> Option<String> {
        let limit = self.policy.max_retries_for(contract.max_retries);
        if observation.attempt > limit {
            return Some(format!("retry limit of {limit} reached"));
        }
        // assume the next attempt costs what this one did
        let projected = state
            .spend
            .plus(observation.cost, observation.duration_ms, true);
        budget
            .exceeded_by(&projected)
            .map(|dimension| format!("a retry would exceed the {dimension} budget"))
    }

    fn escalate(
        &self,
        observation: &Observation,
        trigger: EscalationTrigger,
        rationale: String,
    ) -> Decision {
        let severity = self.policy.severity_for(trigger);
        self.decision(observation, Verdict::Escalate { trigger, severity }, rationale)
    }

    #[allow(clippy::unused_self)]
    fn decision(&self, observation: &Observation, verdict: Verdict, rationale: String) -> Decision {
        Decision::new(
            observation.step_id.clone(),
            observation.attempt,
            verdict,
            rationale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroplan_model::{
        CapabilityId, CheckResult, ContractReport, ContractViolation, ObservationError, Outputs,
        PlanId, RunId, Severity, Spend, StepId, TraceId, VerificationReport,
    };

    fn observation(attempt: u32) -> Observation {
        Observation {
            step_id: StepId::new("s"),
            attempt,
            capability: CapabilityId::new("tool"),
            capability_version: String::new(),
            success: true,
            outputs: Outputs::new(),
            error: None,
            cost: 1.0,
            duration_ms: 10,
            confidence: None,
            raw: serde_json::Value::Null,
            trace_id: TraceId::new(),
            contract: ContractReport::default(),
            verification: Some(VerificationReport {
                tolerance: 0.25,
                ..VerificationReport::default()
            }),
        }
    }

    fn drifting(attempt: u32) -> Observation {
        let mut obs = observation(attempt);
        obs.verification = Some(VerificationReport {
            acceptance: vec![CheckResult::fail("shape", "wrong")],
            gates: Vec::new(),
            drift: 1.0,
            tolerance: 0.25,
        });
        obs
    }

    fn state_with(spend: Spend) -> RunState {
        let mut state = RunState::new(RunId::new(), PlanId::new());
        state.spend = spend;
        state
    }

    fn controller() -> Controller {
        Controller::new(Arc::new(PolicyConfig::default()))
    }

    #[test]
    fn clean_observation_continues() {
        let d = controller().decide(
            &observation(1),
            &ActionContract::new("s", "x", "tool"),
            &state_with(Spend::default()),
            &Budget::default(),
        );
        assert_eq!(d.verdict, Verdict::Continue);
    }

    #[test]
    fn exceeded_budget_escalates_even_when_clean() {
        let budget = Budget {
            max_cost: Some(0.5),
            ..Budget::default()
        };
        let d = controller().decide(
            &observation(1),
            &ActionContract::new("s", "x", "tool"),
            &state_with(Spend::default().plus(1.0, 10, false)),
            &budget,
        );
        assert_eq!(
            d.verdict,
            Verdict::Escalate {
                trigger: EscalationTrigger::BudgetExceeded,
                severity: Severity::S3
            }
        );
    }

    #[test]
    fn drift_retries_then_alternates_then_escalates() {
        let contract = ActionContract::new("s", "x", "tool").with_max_retries(1);
        let state = state_with(Spend::default());
        let c = controller();

        let first = c.decide(&drifting(1), &contract, &state, &Budget::default());
        assert!(matches!(first.verdict, Verdict::Retry { attempt: 2, .. }));

        let second = c.decide(&drifting(2), &contract, &state, &Budget::default());
        assert!(matches!(
            second.verdict,
            Verdict::Escalate {
                trigger: EscalationTrigger::DriftExceeded,
                ..
            }
        ));

        let with_alt = contract.with_alternate(ActionContract::new("s2", "y", "backup"));
        let third = c.decide(&drifting(2), &with_alt, &state, &Budget::default());
        assert_eq!(
            third.verdict,
            Verdict::Alternate {
                capability: CapabilityId::new("backup")
            }
        );
    }

    #[test]
    fn retry_refused_when_it_would_break_budget() {
        let mut obs = observation(1);
        obs.success = false;
        obs.error = Some(ObservationError::new(FailureKind::Capability, "boom"));
        let budget = Budget {
            max_cost: Some(1.5),
            ..Budget::default()
        };
        let d = controller().decide(
            &obs,
            &ActionContract::new("s", "x", "tool"),
            &state_with(Spend::default().plus(1.0, 10, false)),
            &budget,
        );
        assert!(matches!(d.verdict, Verdict::Replan { .. }), "{d:?}");
    }

    #[test]
    fn permanent_failure_skips_retry_and_hits_replan_limit() {
        let mut obs = observation(1);
        obs.success = false;
        obs.error = Some(ObservationError::new(FailureKind::Capability, "denied").permanent());
        let mut state = state_with(Spend::default());
        state.replans = 3;
        let d = controller().decide(
            &obs,
            &ActionContract::new("s", "x", "tool"),
            &state,
            &Budget::default(),
        );
        assert!(matches!(
            d.verdict,
            Verdict::Escalate {
                trigger: EscalationTrigger::ReplanLimit,
                ..
            }
        ));
    }

    #[test]
    fn gate_trip_outranks_everything_but_budget() {
        let mut obs = drifting(1);
        if let Some(v) = obs.verification.as_mut() {
            v.gates.push(CheckResult::fail("pii", "email address"));
        }
        let d = controller().decide(
            &obs,
            &ActionContract::new("s", "x", "tool"),
            &state_with(Spend::default()),
            &Budget::default(),
        );
        assert_eq!(
            d.verdict,
            Verdict::Escalate {
                trigger: EscalationTrigger::GateTripped,
                severity: Severity::S4
            }
        );
    }

    #[test]
    fn low_confidence_and_postconditions_use_their_triggers() {
        let c = controller();
        let state = state_with(Spend::default());
        let contract = ActionContract::new("s", "x", "tool").with_max_retries(0);

        let mut unsure = observation(1);
        unsure.confidence = Some(0.1);
        let d = c.decide(&unsure, &contract, &state, &Budget::default());
        assert!(matches!(
            d.verdict,
            Verdict::Escalate {
                trigger: EscalationTrigger::LowConfidence,
                severity: Severity::S2
            }
        ));

        let mut broken = observation(1);
        broken.contract.violations.push(ContractViolation::new(
            ViolationKind::Postcondition,
            "summary empty",
        ));
        let d = c.decide(&broken, &contract, &state, &Budget::default());
        assert!(matches!(d.verdict, Verdict::Replan { .. }));
    }

    #[test]
    fn precondition_failures_never_retry() {
        let mut obs = observation(1);
        obs.success = false;
        obs.error = Some(ObservationError::new(FailureKind::Precondition, "input.q missing").permanent());
        let mut policy = PolicyConfig::default();
        policy.replan.max_replans = 0;
        let d = Controller::new(Arc::new(policy)).decide(
            &obs,
            &ActionContract::new("s", "x", "tool"),
            &state_with(Spend::default()),
            &Budget::default(),
        );
        assert!(matches!(
            d.verdict,
            Verdict::Escalate {
                trigger: EscalationTrigger::ReplanLimit,
                ..
            }
        ));
    }
}
