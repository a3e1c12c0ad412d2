//! Step executor
//!
//! Invokes a registered capability for one step and normalizes whatever
//! comes back into an [`Observation`]. Capability errors, deadline expiry
//! and cancellation all become `success = false` observations; only an
//! unknown capability is a hard error.

use crate::capability::{Capability, CapabilityFailure, CapabilityRegistry, ExecutionContext};
use crate::error::ExecutorError;
use retroplan_model::{
    ActionContract, CapabilityId, ContractReport, FailureKind, Observation, ObservationError,
    Outputs, PolicyConfig, StepId,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes steps against the capability registry
#[derive(Debug, Clone)]
pub struct Executor {
    registry: Arc<CapabilityRegistry>,
    policy: Arc<PolicyConfig>,
}

impl Executor {
    #[must_use]
    pub fn new(registry: Arc<CapabilityRegistry>, policy: Arc<PolicyConfig>) -> Self {
        Self { registry, policy }
    }

    #[must_use]
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Deadline for a step, honouring its own override
    #[must_use]
    pub fn deadline_for(&self, contract: &ActionContract) -> u64 {
        contract.timeout_ms.unwrap_or(self.policy.timeouts.step_ms)
    }

    /// Execute one contract with already-resolved inputs
    ///
    /// # Errors
    /// Returns [`ExecutorError::UnknownCapability`] if the capability is not
    /// registered
    pub async fn execute(
        &self,
        contract: &ActionContract,
        inputs: &Outputs,
        ctx: &ExecutionContext,
    ) -> Result<Observation, ExecutorError> {
        self.invoke(&contract.id, &contract.capability, inputs, ctx).await
    }

    /// Invoke any capability on behalf of a step
    ///
    /// # Errors
    /// Returns [`ExecutorError::UnknownCapability`] if the capability is not
    /// registered
    pub async fn invoke(
        &self,
        step_id: &StepId,
        capability_id: &CapabilityId,
        inputs: &Outputs,
        ctx: &ExecutionContext,
    ) -> Result<Observation, ExecutorError> {
        let capability = self
            .registry
            .resolve(capability_id)
            .ok_or_else(|| ExecutorError::UnknownCapability(capability_id.clone()))?;

        debug!(
            step_id = %step_id,
            capability = %capability_id,
            attempt = ctx.attempt,
            trace_id = %ctx.trace_id,
            "invoking capability"
        );

        let started = Instant::now();
        let deadline = Duration::from_millis(ctx.deadline_ms);
        let call = async {
            match capability {
                Capability::Tool(tool) => tool.invoke(inputs, ctx).await.map(|r| (r, None)),
                Capability::Agent(agent) => agent
                    .run(inputs, ctx)
                    .await
                    .map(|a| (a.response, Some(a.confidence))),
            }
        };

        let outcome = tokio::select! {
            () = ctx.cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(deadline, call) => match result {
                Ok(Ok((response, confidence))) => Outcome::Success(response, confidence),
                Ok(Err(failure)) => Outcome::Failure(failure),
                Err(_) => Outcome::TimedOut,
            },
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut observation = Observation {
            step_id: step_id.clone(),
            attempt: ctx.attempt,
            capability: capability_id.clone(),
            capability_version: capability.version().to_string(),
            success: false,
            outputs: Outputs::new(),
            error: None,
            cost: 0.0,
            duration_ms: elapsed,
            confidence: None,
            raw: Value::Null,
            trace_id: ctx.trace_id,
            contract: ContractReport::default(),
            verification: None,
        };

        match outcome {
            Outcome::Success(response, confidence) => {
                observation.success = true;
                observation.outputs = response.outputs;
                observation.cost = response.cost;
                observation.duration_ms = response.duration_ms.unwrap_or(elapsed);
                observation.raw = response.raw;
                observation.confidence = confidence;
            }
            Outcome::Failure(failure) => {
                warn!(step_id = %step_id, capability = %capability_id, error = %failure.message, "capability failed");
                observation.cost = failure.cost;
                let error = ObservationError::new(FailureKind::Capability, failure.message);
                observation.error = Some(if failure.retryable {
                    error
                } else {
                    error.permanent()
                });
            }
            Outcome::TimedOut => {
                warn!(step_id = %step_id, capability = %capability_id, deadline_ms = ctx.deadline_ms, "capability timed out");
                observation.error = Some(ObservationError::new(
                    FailureKind::Timeout,
                    format!("no response within {} ms", ctx.deadline_ms),
                ));
            }
            Outcome::Cancelled => {
                debug!(step_id = %step_id, "invocation cancelled");
                observation.error = Some(ObservationError::new(
                    FailureKind::Cancelled,
                    "invocation cancelled",
                ));
            }
        }

        if let Some(problem) = invalid_report(observation.cost, observation.confidence) {
            warn!(step_id = %step_id, capability = %capability_id, %problem, "rejecting capability response");
            observation.success = false;
            observation.outputs = Outputs::new();
            observation.cost = 0.0;
            observation.confidence = None;
            observation.error =
                Some(ObservationError::new(FailureKind::InvalidResponse, problem).permanent());
        }
        Ok(observation)
    }
}

/// Reported cost must be a finite non-negative number, confidence within [0, 1]
fn invalid_report(cost: f64, confidence: Option<f64>) -> Option<String> {
    if !cost.is_finite() || cost < 0.0 {
        return Some(format!("invalid cost {cost}"));
    }
    match confidence {
        Some(c) if !(0.0..=1.0).contains(&c) => Some(format!("invalid confidence {c}")),
        _ => None,
    }
}

enum Outcome {
    Success(crate::capability::CapabilityResponse, Option<f64>),
    Failure(CapabilityFailure),
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{AgentResponse, Agent, CapabilityResponse, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct Sleepy(u64);

    #[async_trait]
    impl Tool for Sleepy {
        async fn invoke(
            &self,
            _inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            Ok(CapabilityResponse::default())
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        async fn invoke(
            &self,
            _inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            Err(CapabilityFailure {
                cost: 0.3,
                ..CapabilityFailure::permanent("quota")
            })
        }
    }

    struct Unsure;

    #[async_trait]
    impl Agent for Unsure {
        async fn run(
            &self,
            inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<AgentResponse, CapabilityFailure> {
            Ok(AgentResponse {
                response: CapabilityResponse::new(inputs.clone()).with_cost(0.1),
                confidence: 0.4,
            })
        }
    }

    /// Succeeds but reports whatever cost it was given
    struct Misreporting(f64);

    #[async_trait]
    impl Tool for Misreporting {
        async fn invoke(
            &self,
            inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            Ok(CapabilityResponse::new(inputs.clone()).with_cost(self.0))
        }
    }

    fn executor() -> Executor {
        let registry = CapabilityRegistry::builder()
            .tool("sleepy", Sleepy(10_000))
            .tool("broken", Broken)
            .tool("nan", Misreporting(f64::NAN))
            .tool("refund", Misreporting(-100.0))
            .tool("infinite", Misreporting(f64::INFINITY))
            .agent("unsure", Unsure)
            .build();
        Executor::new(Arc::new(registry), Arc::new(PolicyConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_a_failed_observation() {
        let ctx = ExecutionContext::new(StepId::new("s"), 50);
        let obs = executor()
            .invoke(&StepId::new("s"), &"sleepy".into(), &Outputs::new(), &ctx)
            .await
            .unwrap();
        assert!(!obs.success);
        assert_eq!(obs.failure_kind(), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn capability_errors_keep_cost_and_retryability() {
        let ctx = ExecutionContext::new(StepId::new("s"), 1_000);
        let obs = executor()
            .invoke(&StepId::new("s"), &"broken".into(), &Outputs::new(), &ctx)
            .await
            .unwrap();
        assert!(!obs.success);
        assert!((obs.cost - 0.3).abs() < f64::EPSILON);
        assert!(!obs.error.unwrap().retryable);
    }

    #[tokio::test]
    async fn agents_report_confidence() {
        let ctx = ExecutionContext::new(StepId::new("s"), 1_000);
        let inputs: Outputs = serde_json::from_value(json!({"q": "x"})).unwrap();
        let obs = executor()
            .invoke(&StepId::new("s"), &"unsure".into(), &inputs, &ctx)
            .await
            .unwrap();
        assert!(obs.success);
        assert_eq!(obs.confidence, Some(0.4));
        assert_eq!(obs.outputs["q"], json!("x"));
    }

    #[tokio::test]
    async fn unusable_costs_become_permanent_failures() {
        let ctx = ExecutionContext::new(StepId::new("s"), 1_000);
        let inputs: Outputs = serde_json::from_value(json!({"q": "x"})).unwrap();
        for capability in ["nan", "refund", "infinite"] {
            let obs = executor()
                .invoke(&StepId::new("s"), &capability.into(), &inputs, &ctx)
                .await
                .unwrap();
            assert!(!obs.success, "{capability}");
            assert!(obs.outputs.is_empty());
            assert!(obs.cost.abs() < f64::EPSILON);
            let error = obs.error.unwrap();
            assert_eq!(error.kind, FailureKind::InvalidResponse);
            assert!(!error.retryable);
        }
    }

    #[test]
    fn confidence_outside_unit_range_is_rejected() {
        assert!(invalid_report(0.5, Some(0.9)).is_none());
        assert!(invalid_report(0.5, Some(1.5)).is_some());
        assert!(invalid_report(0.5, Some(f64::NAN)).is_some());
        assert!(invalid_report(-0.1, None).is_some());
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_capability() {
        let ctx = ExecutionContext::new(StepId::new("s"), 60_000);
        ctx.cancel.cancel();
        let obs = executor()
            .invoke(&StepId::new("s"), &"sleepy".into(), &Outputs::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(obs.failure_kind(), Some(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn unknown_capability_is_hard_error() {
        let ctx = ExecutionContext::new(StepId::new("s"), 1_000);
        let err = executor()
            .invoke(&StepId::new("s"), &"missing".into(), &Outputs::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownCapability(_)));
    }
}
