//! Planner: brainstorm, verify capabilities, generate
//!
//! How candidates are produced is the [`PlanProposer`]'s business. The
//! planner ranks and filters them, refuses to emit a plan that references
//! an unregistered capability, and sanitizes replan patches so completed
//! work is preserved.

use crate::capability::CapabilityRegistry;
use crate::error::{CapabilityMissingError, PlannerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use retroplan_model::{
    BrainstormResult, Candidate, CapabilityVerification, EscalationTrigger, PatchOp, Plan,
    PolicyConfig, RunState, StepId, TaskBrief,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the coordinator wants a new plan version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanRequest {
    /// Step that triggered the replan; `None` for final acceptance failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub reason: String,
}

/// External plan generator
#[async_trait]
pub trait PlanProposer: Send + Sync {
    /// Candidate approaches for a brief, in any order
    async fn brainstorm(
        &self,
        brief: &TaskBrief,
        max_candidates: usize,
    ) -> Result<Vec<Candidate>, PlannerError>;

    /// Operations that repair `plan` given the run so far
    async fn propose_patch(
        &self,
        plan: &Plan,
        state: &RunState,
        request: &ReplanRequest,
    ) -> Result<Vec<PatchOp>, PlannerError>;
}

/// Proposer with fixed candidates and queued repair patches
///
/// With no queued patch, a replan re-issues the failing step's current
/// contract, which gives it a fresh attempt budget under a new version.
#[derive(Debug, Default)]
pub struct StaticProposer {
    candidates: Vec<Candidate>,
    patches: Mutex<VecDeque<Vec<PatchOp>>>,
}

impl StaticProposer {
    #[must_use]
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            patches: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue the operations returned by the next replan
    #[must_use]
    pub fn with_patch(self, ops: Vec<PatchOp>) -> Self {
        self.patches.lock().push_back(ops);
        self
    }
}

#[async_trait]
impl PlanProposer for StaticProposer {
    async fn brainstorm(
        &self,
        _brief: &TaskBrief,
        _max_candidates: usize,
    ) -> Result<Vec<Candidate>, PlannerError> {
        Ok(self.candidates.clone())
    }

    async fn propose_patch(
        &self,
        plan: &Plan,
        _state: &RunState,
        request: &ReplanRequest,
    ) -> Result<Vec<PatchOp>, PlannerError> {
        if let Some(ops) = self.patches.lock().pop_front() {
            return Ok(ops);
        }
        let target = request
            .step_id
            .clone()
            .or_else(|| plan.topological_order().pop())
            .ok_or_else(|| PlannerError::Proposer("plan has no steps".into()))?;
        let step = plan
            .step(&target)
            .cloned()
            .ok_or_else(|| PlannerError::Proposer(format!("unknown step `{target}`")))?;
        Ok(vec![PatchOp::ReplaceStep { step }])
    }
}

/// A generated plan with the evidence behind it
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub brainstorm: BrainstormResult,
    pub verification: CapabilityVerification,
}

/// Turns briefs into plans and failures into patches
#[derive(Clone)]
pub struct Planner {
    proposer: Arc<dyn PlanProposer>,
    registry: Arc<CapabilityRegistry>,
    policy: Arc<PolicyConfig>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("capabilities", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Planner {
    #[must_use]
    pub fn new(
        proposer: Arc<dyn PlanProposer>,
        registry: Arc<CapabilityRegistry>,
        policy: Arc<PolicyConfig>,
    ) -> Self {
        Self {
            proposer,
            registry,
            policy,
        }
    }

    /// Phase one: ranked, filtered candidates
    ///
    /// # Errors
    /// Returns [`PlannerError::NoCandidates`] if nothing clears the
    /// feasibility floor
    pub async fn brainstorm(&self, brief: &TaskBrief) -> Result<BrainstormResult, PlannerError> {
        let limit = self.policy.planner.max_candidates;
        let mut candidates = self.proposer.brainstorm(brief, limit).await?;
        let offered = candidates.len();
        candidates.retain(|c| {
            !c.steps.is_empty() && c.feasibility >= self.policy.planner.min_feasibility
        });
        let mut result = BrainstormResult::ranked(candidates);
        result.candidates.truncate(limit);
        debug!(
            offered,
            kept = result.candidates.len(),
            "brainstorm finished"
        );
        if result.candidates.is_empty() {
            return Err(PlannerError::NoCandidates(brief.objective.clone()));
        }
        Ok(result)
    }

    /// Phase two: availability of every capability the candidate may use
    #[must_use]
    pub fn verify(&self, candidate: &Candidate) -> CapabilityVerification {
        self.registry.verify(candidate)
    }

    /// Phase three: version 0 of a plan from a verified candidate
    ///
    /// # Errors
    /// Returns [`PlannerError::CapabilityMissing`] if verification is
    /// incomplete, or [`PlannerError::Plan`] if the candidate is malformed
    pub fn generate(
        &self,
        brief: &TaskBrief,
        candidate: &Candidate,
        verification: &CapabilityVerification,
    ) -> Result<Plan, PlannerError> {
        if !verification.is_complete() {
            return Err(self.missing(&candidate.name, verification.missing()).into());
        }
        let plan = Plan::new(
            brief.clone(),
            candidate.steps.clone(),
            candidate.dependencies.clone(),
        )?;
        info!(
            plan_id = %plan.plan_id,
            candidate = %candidate.name,
            steps = plan.steps.len(),
            "plan generated"
        );
        Ok(plan)
    }

    /// All three phases
    ///
    /// # Errors
    /// Returns the first phase failure
    pub async fn plan(&self, brief: &TaskBrief) -> Result<PlanOutcome, PlannerError> {
        let brainstorm = self.brainstorm(brief).await?;
        let best = brainstorm
            .best()
            .ok_or_else(|| PlannerError::NoCandidates(brief.objective.clone()))?;
        let verification = self.verify(best);
        let plan = self.generate(brief, best, &verification)?;
        Ok(PlanOutcome {
            plan,
            brainstorm,
            verification,
        })
    }

    /// Patch operations repairing `plan`
    ///
    /// Operations touching completed steps are dropped, except for the
    /// requesting step itself. New contracts must only use registered
    /// capabilities.
    ///
    /// # Errors
    /// Returns [`PlannerError::CapabilityMissing`] for unregistered
    /// capabilities, or [`PlannerError::Proposer`] if nothing applicable
    /// remains
    pub async fn replan(
        &self,
        plan: &Plan,
        state: &RunState,
        request: &ReplanRequest,
    ) -> Result<Vec<PatchOp>, PlannerError> {
        let proposed = self.proposer.propose_patch(plan, state, request).await?;
        let ops: Vec<PatchOp> = proposed
            .into_iter()
            .filter(|op| {
                let id = op.step_id();
                let keep = !state.completed.contains(id) || request.step_id.as_ref() == Some(id);
                if !keep {
                    warn!(step_id = %id, op = op.kind(), "replan op touches completed step, dropped");
                }
                keep
            })
            .collect();
        if ops.is_empty() {
            return Err(PlannerError::Proposer(format!(
                "no applicable operations for `{}`",
                request.reason
            )));
        }

        let missing: BTreeSet<_> = ops
            .iter()
            .filter_map(|op| match op {
                PatchOp::AddStep { step, .. } | PatchOp::ReplaceStep { step } => Some(step),
                PatchOp::RemoveStep { .. } | PatchOp::SetDependencies { .. } => None,
            })
            .flat_map(retroplan_model::ActionContract::capabilities)
            .filter(|c| !self.registry.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(self.missing("replan", missing.into_iter().collect()).into());
        }
        Ok(ops)
    }

    fn missing(
        &self,
        candidate: &str,
        missing: Vec<retroplan_model::CapabilityId>,
    ) -> CapabilityMissingError {
        CapabilityMissingError {
            candidate: candidate.to_string(),
            missing,
            severity: self.policy.severity_for(EscalationTrigger::CapabilityMissing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityFailure, CapabilityResponse, ExecutionContext, Tool};
    use retroplan_model::{ActionContract, Outputs, PlanId, RunId, Severity};

    struct Noop;

    #[async_trait]
    impl Tool for Noop {
        async fn invoke(
            &self,
            _inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            Ok(CapabilityResponse::default())
        }
    }

    fn registry() -> Arc<CapabilityRegistry> {
        Arc::new(CapabilityRegistry::builder().tool("echo", Noop).build())
    }

    fn planner(proposer: StaticProposer) -> Planner {
        Planner::new(
            Arc::new(proposer),
            registry(),
            Arc::new(PolicyConfig::default()),
        )
    }

    #[tokio::test]
    async fn picks_most_feasible_candidate() {
        let proposer = StaticProposer::new(vec![
            Candidate::new("slow", 0.4).step(ActionContract::new("a", "a", "echo"), &[]),
            Candidate::new("fast", 0.9)
                .step(ActionContract::new("a", "a", "echo"), &[])
                .step(ActionContract::new("b", "b", "echo"), &["a"]),
        ]);
        let outcome = planner(proposer).plan(&TaskBrief::new("t")).await.unwrap();
        assert_eq!(outcome.brainstorm.best().unwrap().name, "fast");
        assert_eq!(outcome.plan.steps.len(), 2);
        assert_eq!(outcome.plan.version, 0);
        assert!(outcome.verification.is_complete());
    }

    #[tokio::test]
    async fn missing_capability_is_reported_with_policy_severity() {
        let proposer = StaticProposer::new(vec![Candidate::new("web", 0.9)
            .step(ActionContract::new("a", "a", "echo"), &[])
            .step(ActionContract::new("b", "b", "search"), &["a"])]);
        let err = planner(proposer).plan(&TaskBrief::new("t")).await.unwrap_err();
        let missing = match err {
            PlannerError::CapabilityMissing(missing) => missing,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(missing.missing, vec![retroplan_model::CapabilityId::new("search")]);
        assert_eq!(missing.severity, Severity::S3);
    }

    #[tokio::test]
    async fn infeasible_candidates_are_filtered() {
        let mut policy = PolicyConfig::default();
        policy.planner.min_feasibility = 0.5;
        let planner = Planner::new(
            Arc::new(StaticProposer::new(vec![Candidate::new("long shot", 0.1)
                .step(ActionContract::new("a", "a", "echo"), &[])])),
            registry(),
            Arc::new(policy),
        );
        assert!(matches!(
            planner.plan(&TaskBrief::new("t")).await,
            Err(PlannerError::NoCandidates(_))
        ));
    }

    #[tokio::test]
    async fn replan_preserves_completed_steps() {
        let plan = Plan::sequential(
            TaskBrief::new("t"),
            vec![
                ActionContract::new("a", "a", "echo"),
                ActionContract::new("b", "b", "echo"),
            ],
        )
        .unwrap();
        let mut state = RunState::new(RunId::new(), PlanId::new());
        state.completed.insert("a".into());

        let proposer = StaticProposer::new(Vec::new()).with_patch(vec![
            PatchOp::ReplaceStep {
                step: ActionContract::new("a", "redo", "echo"),
            },
            PatchOp::ReplaceStep {
                step: ActionContract::new("b", "retry", "echo"),
            },
        ]);
        let request = ReplanRequest {
            step_id: Some("b".into()),
            reason: "failed".into(),
        };
        let ops = planner(proposer).replan(&plan, &state, &request).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].step_id(), &StepId::new("b"));
    }

    #[tokio::test]
    async fn replan_rejects_unregistered_capabilities() {
        let plan = Plan::sequential(TaskBrief::new("t"), vec![ActionContract::new("a", "a", "echo")])
            .unwrap();
        let state = RunState::new(RunId::new(), plan.plan_id);
        let proposer = StaticProposer::new(Vec::new()).with_patch(vec![PatchOp::ReplaceStep {
            step: ActionContract::new("a", "a", "crawl"),
        }]);
        let request = ReplanRequest {
            step_id: Some("a".into()),
            reason: "failed".into(),
        };
        assert!(matches!(
            planner(proposer).replan(&plan, &state, &request).await,
            Err(PlannerError::CapabilityMissing(_))
        ));
    }

    #[tokio::test]
    async fn default_replan_reissues_failing_step() {
        let plan = Plan::sequential(TaskBrief::new("t"), vec![ActionContract::new("a", "a", "echo")])
            .unwrap();
        let state = RunState::new(RunId::new(), plan.plan_id);
        let request = ReplanRequest {
            step_id: None,
            reason: "acceptance failed".into(),
        };
        let ops = planner(StaticProposer::default())
            .replan(&plan, &state, &request)
            .await
            .unwrap();
        assert_eq!(ops, vec![PatchOp::ReplaceStep { step: plan.steps[0].clone() }]);
    }
}
