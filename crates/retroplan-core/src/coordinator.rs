//! The coordinator: one control loop per task execution
//!
//! Owns the run state (single writer) and drives planner, executor,
//! validator, verifier, controller and patcher. Ready steps run
//! concurrently; retrospects report back over a channel and can open
//! invalidation tickets at any time, including while promotion is held.
//!
//! ```text
//! planning ─► running ─┬─► pending_verification ─► done
//!                      ├─► paused ────┐
//!                      ├─► escalated ─┴─(resume)─► running
//!                      └─► failed
//! ```

use crate::binding::resolve_inputs;
use crate::capability::{CapabilityRegistry, ExecutionContext};
use crate::checkpoint::CheckpointStore;
use crate::controller::Controller;
use crate::error::{EngineError, ExecutorError, PlannerError};
use crate::escalation::{
    EscalationAction, EscalationOutcome, EscalationPayload, EscalationRouter, LogNotifier, Notifier,
};
use crate::events::{AuditLog, EventBus, EventSink, RunEvent, TracingSink};
use crate::executor::Executor;
use crate::patcher::PlanPatcher;
use crate::planner::{PlanProposer, Planner, ReplanRequest};
use crate::replay::ReplayManager;
use crate::retrospect::{CustomCheck, RetroSnapshot, RetrospectRunner};
use crate::validator::ContractValidator;
use crate::verify::Verifier;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use retroplan_lineage::LineageGraph;
use retroplan_model::{
    ActionContract, ArtifactSource, BrainstormResult, Budget, CapabilityVerification, Checkpoint,
    CheckResult, CompensationRecord, ContentHash, Decision, EscalationTrigger, FailureKind,
    InvalidationTicket, JobId, JobStatus, Observation, ObservationError, Outputs, PlanId, PlanPatch,
    Plan, PolicyConfig, Provenance, RetrospectJob, RunId, RunState, RunStatus, Scope, Severity,
    Spend, StepId, TaskBrief, TicketStatus, TraceId, Verdict,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a caller learns about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Identity of this execution
    pub run_id: RunId,
    /// Plan identity; stable across patches
    pub plan_id: PlanId,
    /// Status when the run loop stopped
    pub status: RunStatus,
    /// Version of the plan the run ended on
    pub plan_version: u64,
    /// Final result; only present once promotion was granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    /// Accumulated cost, latency and retries
    pub spend: Spend,
    /// Every controller decision, in order
    pub decisions: Vec<Decision>,
    /// Plan patch history
    pub patches: Vec<PlanPatch>,
    /// Invalidation tickets opened by failed retrospects
    pub tickets: Vec<InvalidationTicket>,
    /// Undo actions run while replaying
    pub compensations: Vec<CompensationRecord>,
    /// Routed escalations with their delivery acks
    pub escalations: Vec<EscalationOutcome>,
    /// Every retrospect job scheduled during the run
    pub retrospects: Vec<RetrospectJob>,
    /// Acceptance checks from the latest promotion attempt
    pub final_acceptance: Vec<CheckResult>,
    /// Candidates weighed before planning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brainstorm: Option<BrainstormResult>,
    /// Capability check of the chosen candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_verification: Option<CapabilityVerification>,
}

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder {
    registry: CapabilityRegistry,
    proposer: Arc<dyn PlanProposer>,
    policy: PolicyConfig,
    channels: Vec<(Severity, Arc<dyn Notifier>)>,
    custom: HashMap<String, Arc<dyn CustomCheck>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CoordinatorBuilder {
    /// Builder with the default policy and no extra channels or sinks
    #[must_use]
    pub fn new(registry: CapabilityRegistry, proposer: impl PlanProposer + 'static) -> Self {
        Self {
            registry,
            proposer: Arc::new(proposer),
            policy: PolicyConfig::default(),
            channels: Vec::new(),
            custom: HashMap::new(),
            sinks: Vec::new(),
        }
    }

    /// Replace the default policy
    #[must_use]
    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Subscribe a notification channel at or above `min_severity`
    #[must_use]
    pub fn notifier(mut self, min_severity: Severity, notifier: Arc<dyn Notifier>) -> Self {
        self.channels.push((min_severity, notifier));
        self
    }

    /// Register a custom retrospect check by name
    #[must_use]
    pub fn custom_check(mut self, name: impl Into<String>, check: Arc<dyn CustomCheck>) -> Self {
        self.custom.insert(name.into(), check);
        self
    }

    /// Add an event sink next to the built-in tracing sink and audit log
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validate the policy and wire every component
    ///
    /// # Errors
    /// Returns [`EngineError::Policy`] if the policy is invalid
    pub fn build(self) -> Result<Coordinator, EngineError> {
        self.policy.validate()?;
        let policy = Arc::new(self.policy);
        let registry = Arc::new(self.registry);

        let audit = Arc::new(AuditLog::new());
        let mut events = EventBus::new()
            .with_sink(Arc::new(TracingSink))
            .with_sink(Arc::clone(&audit) as Arc<dyn EventSink>);
        for sink in self.sinks {
            events.add_sink(sink);
        }

        let mut router = EscalationRouter::new(Arc::clone(&policy));
        if self.channels.is_empty() {
            router = router.with_channel(Severity::S1, Arc::new(LogNotifier));
        }
        for (min_severity, notifier) in self.channels {
            router = router.with_channel(min_severity, notifier);
        }

        let (runner, retro_rx) = RetrospectRunner::new(
            Arc::clone(&policy),
            Arc::new(events.clone()),
            self.custom,
        );
        let lineage = Arc::new(LineageGraph::new());
        let executor = Executor::new(Arc::clone(&registry), Arc::clone(&policy));

        Ok(Coordinator {
            planner: Planner::new(self.proposer, Arc::clone(&registry), Arc::clone(&policy)),
            validator: ContractValidator::new(Arc::clone(&policy)),
            verifier: Verifier::new(Arc::clone(&policy)),
            controller: Controller::new(Arc::clone(&policy)),
            replay: ReplayManager::new(Arc::clone(&lineage), executor.clone(), Arc::clone(&policy)),
            executor,
            router,
            runner,
            retro_rx,
            lineage,
            checkpoints: CheckpointStore::new(),
            audit,
            events,
            policy,
            state: RunState::new(RunId::new(), PlanId::new()),
            brief: None,
            budget: Budget::default(),
            patcher: None,
            in_flight: FuturesUnordered::new(),
            running: BTreeMap::new(),
            backoff: BTreeMap::new(),
            scheduled: BTreeMap::new(),
            replays: BTreeMap::new(),
            tickets: Vec::new(),
            compensations: Vec::new(),
            escalations: Vec::new(),
            final_acceptance: Vec::new(),
            brainstorm: None,
            capability_verification: None,
            result: None,
            acknowledged: false,
        })
    }
}

/// Result of one launched attempt
struct StepOutcome {
    step_id: StepId,
    contract: ActionContract,
    inputs: Outputs,
    observation: Result<Observation, ExecutorError>,
}

/// Bookkeeping for a launched attempt
struct InFlight {
    cancel: CancellationToken,
    /// Upstream artifacts the attempt was bound against
    upstream: BTreeMap<StepId, ContentHash>,
}

enum LoopEvent {
    Step(StepOutcome),
    Retrospect(RetrospectJob),
    Idle,
}

/// Drives one task execution from brief to promoted result
pub struct Coordinator {
    policy: Arc<PolicyConfig>,
    planner: Planner,
    executor: Executor,
    validator: ContractValidator,
    verifier: Verifier,
    controller: Controller,
    router: EscalationRouter,
    replay: ReplayManager,
    runner: RetrospectRunner,
    retro_rx: mpsc::UnboundedReceiver<RetrospectJob>,
    lineage: Arc<LineageGraph>,
    checkpoints: CheckpointStore,
    audit: Arc<AuditLog>,
    events: EventBus,

    state: RunState,
    brief: Option<Arc<TaskBrief>>,
    budget: Budget,
    patcher: Option<PlanPatcher>,
    in_flight: FuturesUnordered<BoxFuture<'static, StepOutcome>>,
    running: BTreeMap<StepId, InFlight>,
    backoff: BTreeMap<StepId, u64>,
    /// Retrospect jobs scheduled for each step's current commit
    scheduled: BTreeMap<StepId, Vec<JobId>>,
    replays: BTreeMap<StepId, u32>,
    tickets: Vec<InvalidationTicket>,
    compensations: Vec<CompensationRecord>,
    escalations: Vec<EscalationOutcome>,
    final_acceptance: Vec<CheckResult>,
    brainstorm: Option<BrainstormResult>,
    capability_verification: Option<CapabilityVerification>,
    result: Option<Outputs>,
    acknowledged: bool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("run_id", &self.state.run_id)
            .field("status", &self.state.status)
            .field("plan_version", &self.state.plan_version)
            .field("in_flight", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Start building a coordinator
    #[must_use]
    pub fn builder(
        registry: CapabilityRegistry,
        proposer: impl PlanProposer + 'static,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder::new(registry, proposer)
    }

    /// Current run status
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.state.status
    }

    /// The authoritative run state
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Hash-chained record of every run event
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Provenance of every committed artifact
    #[must_use]
    pub fn lineage(&self) -> &LineageGraph {
        &self.lineage
    }

    /// Checkpoints committed so far
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Policy the run is configured with
    #[must_use]
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Current plan version, once planning succeeded
    #[must_use]
    pub fn current_plan(&self) -> Option<Arc<Plan>> {
        self.patcher.as_ref().map(PlanPatcher::current)
    }

    /// Plan and execute a brief
    ///
    /// Returns when the run is done, failed, paused, escalated or held
    /// pending verification. Missing capabilities leave the run in
    /// `planning`.
    ///
    /// # Errors
    /// Returns a hard engine error (malformed plan, unresolvable binding,
    /// unknown capability, corrupt state); the run is marked failed
    pub async fn run(&mut self, brief: TaskBrief) -> Result<RunReport, EngineError> {
        if self.brief.is_some() {
            return Err(EngineError::InvalidState {
                status: self.state.status,
                action: "start a second run",
            });
        }
        info!(run_id = %self.state.run_id, objective = %brief.objective, "run started");
        self.budget = self.policy.effective_budget(brief.constraints);
        let brief = Arc::new(brief);
        self.brief = Some(Arc::clone(&brief));

        let brainstorm = match self.planner.brainstorm(&brief).await {
            Ok(brainstorm) => brainstorm,
            Err(e) => return self.abort(e.into()),
        };
        let Some(best) = brainstorm.best().cloned() else {
            return self.abort(PlannerError::NoCandidates(brief.objective.clone()).into());
        };
        let verification = self.planner.verify(&best);
        self.brainstorm = Some(brainstorm);
        self.capability_verification = Some(verification.clone());

        let plan = match self.planner.generate(&brief, &best, &verification) {
            Ok(plan) => plan,
            Err(PlannerError::CapabilityMissing(missing)) => {
                warn!(run_id = %self.state.run_id, error = %missing, "refusing to execute plan");
                self.escalate(
                    None,
                    EscalationTrigger::CapabilityMissing,
                    missing.severity,
                    missing.to_string(),
                )
                .await;
                return Ok(self.report());
            }
            Err(e) => return self.abort(e.into()),
        };

        self.state.plan_id = plan.plan_id;
        self.state.plan_version = plan.version;
        self.events.emit(&RunEvent::PlanCreated {
            run_id: self.state.run_id,
            plan_id: plan.plan_id,
            version: plan.version,
            steps: plan.steps.len(),
            candidate: best.name.clone(),
        });
        self.patcher = Some(PlanPatcher::new(plan));
        if let Err(e) = self.set_status(RunStatus::Running) {
            return self.abort(e);
        }
        self.drive().await
    }

    /// Continue a paused, held or acknowledged escalated run
    ///
    /// # Errors
    /// Returns [`EngineError::NotAcknowledged`] for an unacknowledged
    /// escalation, [`EngineError::InvalidState`] for any other status, or a
    /// hard engine error raised while driving
    pub async fn resume(&mut self) -> Result<RunReport, EngineError> {
        match self.state.status {
            RunStatus::Paused | RunStatus::PendingVerification => {}
            RunStatus::Escalated if self.acknowledged => self.acknowledged = false,
            RunStatus::Escalated => return Err(EngineError::NotAcknowledged),
            status => {
                return Err(EngineError::InvalidState {
                    status,
                    action: "resume",
                })
            }
        }
        info!(run_id = %self.state.run_id, from = %self.state.status, "run resumed");
        self.set_status(RunStatus::Running)?;
        self.drive().await
    }

    /// Operator acknowledgement required before an escalated run resumes
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidState`] unless the run is escalated
    pub fn acknowledge_escalation(&mut self) -> Result<(), EngineError> {
        if self.state.status != RunStatus::Escalated {
            return Err(EngineError::InvalidState {
                status: self.state.status,
                action: "acknowledge an escalation",
            });
        }
        info!(run_id = %self.state.run_id, "escalation acknowledged");
        self.acknowledged = true;
        Ok(())
    }

    /// Snapshot of the run so far
    #[must_use]
    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.state.run_id,
            plan_id: self.state.plan_id,
            status: self.state.status,
            plan_version: self.state.plan_version,
            outputs: self.result.clone(),
            spend: self.state.spend,
            decisions: self.state.decisions.clone(),
            patches: self
                .patcher
                .as_ref()
                .map(PlanPatcher::history)
                .unwrap_or_default(),
            tickets: self.tickets.clone(),
            compensations: self.compensations.clone(),
            escalations: self.escalations.clone(),
            retrospects: self.runner.jobs(),
            final_acceptance: self.final_acceptance.clone(),
            brainstorm: self.brainstorm.clone(),
            capability_verification: self.capability_verification.clone(),
        }
    }

    async fn drive(&mut self) -> Result<RunReport, EngineError> {
        while self.state.status == RunStatus::Running {
            if let Err(e) = self.round().await {
                return self.abort(e);
            }
        }
        info!(
            run_id = %self.state.run_id,
            status = %self.state.status,
            plan_version = self.state.plan_version,
            "run loop stopped"
        );
        Ok(self.report())
    }

    /// One pass of the loop: drain finished retrospects, launch ready
    /// steps, then wait for the next step outcome or retrospect
    async fn round(&mut self) -> Result<(), EngineError> {
        while let Ok(job) = self.retro_rx.try_recv() {
            self.on_retrospect(job).await?;
            if self.state.status != RunStatus::Running {
                return Ok(());
            }
        }

        let plan = self.plan()?;
        if let Some(dimension) = self.budget.exceeded_by(&self.state.spend) {
            if self.running.is_empty() && !self.state.all_complete(&plan) {
                let outcome = self
                    .escalate(
                        None,
                        EscalationTrigger::BudgetExceeded,
                        self.router.classify(EscalationTrigger::BudgetExceeded),
                        format!("run {dimension} budget exhausted before remaining steps"),
                    )
                    .await;
                return self.settle(&outcome, "budget exhausted");
            }
        } else {
            self.launch_ready(&plan)?;
        }

        if self.in_flight.is_empty() {
            return self.promote().await;
        }

        let event = tokio::select! {
            Some(outcome) = self.in_flight.next() => LoopEvent::Step(outcome),
            Some(job) = self.retro_rx.recv() => LoopEvent::Retrospect(job),
            else => LoopEvent::Idle,
        };
        match event {
            LoopEvent::Step(outcome) => self.on_step(outcome).await,
            LoopEvent::Retrospect(job) => self.on_retrospect(job).await,
            LoopEvent::Idle => Err(EngineError::Internal("run loop has nothing to wait on".into())),
        }
    }

    fn launch_ready(&mut self, plan: &Plan) -> Result<(), EngineError> {
        let brief = self.brief()?;
        let running: BTreeSet<StepId> = self.running.keys().cloned().collect();

        for step_id in plan.ready_steps(&self.state.completed, &running) {
            let Some(contract) = plan.step(&step_id).cloned() else {
                continue;
            };
            let (preconditions, inputs) = {
                let scope = Scope::new(&brief.inputs, &self.state.outputs);
                let report = self.validator.check_preconditions(&contract, &scope);
                let inputs = if report.is_clean() {
                    Some(resolve_inputs(&contract.inputs, &scope)?)
                } else {
                    None
                };
                (report, inputs)
            };
            let attempt = self.state.begin_attempt(&step_id);
            let upstream = upstream_artifacts(plan, &contract, &self.state);
            let cancel = CancellationToken::new();

            let future = match inputs {
                None => {
                    let detail = preconditions
                        .violations
                        .iter()
                        .map(|v| v.detail.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    debug!(step_id = %step_id, %detail, "preconditions unmet, not invoking");
                    let mut observation = Observation::failed(
                        step_id.clone(),
                        attempt,
                        contract.capability.clone(),
                        ObservationError::new(FailureKind::Precondition, detail).permanent(),
                        TraceId::new(),
                    );
                    observation.contract = preconditions;
                    futures::future::ready(StepOutcome {
                        step_id: step_id.clone(),
                        contract,
                        inputs: Outputs::new(),
                        observation: Ok(observation),
                    })
                    .boxed()
                }
                Some(inputs) => {
                    let ctx = ExecutionContext {
                        trace_id: TraceId::new(),
                        step_id: step_id.clone(),
                        attempt,
                        budget_remaining: self.budget.remaining(&self.state.spend),
                        deadline_ms: self.executor.deadline_for(&contract),
                        cancel: cancel.clone(),
                    };
                    let backoff = self.backoff.remove(&step_id).unwrap_or(0);
                    let executor = self.executor.clone();
                    let step_id = step_id.clone();
                    async move {
                        if backoff > 0 {
                            tokio::select! {
                                () = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                                () = ctx.cancel.cancelled() => {}
                            }
                        }
                        let observation = executor.execute(&contract, &inputs, &ctx).await;
                        StepOutcome {
                            step_id,
                            contract,
                            inputs,
                            observation,
                        }
                    }
                    .boxed()
                }
            };

            debug!(step_id = %step_id, attempt, plan_version = plan.version, "step launched");
            self.running.insert(step_id, InFlight { cancel, upstream });
            self.in_flight.push(future);
        }
        Ok(())
    }

    async fn on_step(&mut self, outcome: StepOutcome) -> Result<(), EngineError> {
        let StepOutcome {
            step_id,
            contract,
            inputs,
            observation,
        } = outcome;
        let launched = self.running.remove(&step_id);
        let mut observation = observation?;
        let plan = self.plan()?;

        let superseded = plan.step(&step_id) != Some(&contract)
            || launched.map_or(true, |f| {
                f.upstream != upstream_artifacts(&plan, &contract, &self.state)
            });
        if observation.failure_kind() == Some(FailureKind::Cancelled) || superseded {
            debug!(step_id = %step_id, "discarding superseded attempt");
            if let Some(n) = self.state.attempts.get_mut(&step_id) {
                *n = n.saturating_sub(1);
            }
            if observation.failure_kind() != Some(FailureKind::Cancelled) {
                // the capability still ran and spent
                self.state.record(observation);
            }
            return Ok(());
        }

        let brief = self.brief()?;
        let spend = self.state.spend.plus(
            observation.cost,
            observation.duration_ms,
            observation.attempt > 1,
        );
        {
            let scope = Scope::new(&brief.inputs, &self.state.outputs);
            let post = self.validator.check_postconditions(
                &contract,
                &observation,
                &scope,
                &self.budget,
                &spend,
            );
            observation.contract.merge(post);
            observation.verification =
                self.verifier.verify(&brief, &contract, &observation, &scope);
        }

        self.events.emit(&RunEvent::StepExecuted {
            run_id: self.state.run_id,
            step_id: step_id.clone(),
            attempt: observation.attempt,
            success: observation.success,
            cost: observation.cost,
            duration_ms: observation.duration_ms,
        });
        #[allow(clippy::cast_precision_loss)]
        metrics::histogram!("retroplan_step_duration_ms").record(observation.duration_ms as f64);
        self.state.record(observation.clone());

        let decision = self
            .controller
            .decide(&observation, &contract, &self.state, &self.budget);
        metrics::counter!("retroplan_decisions_total", "verdict" => decision.verdict.name())
            .increment(1);
        self.state.decisions.push(decision.clone());
        self.events.emit(&RunEvent::DecisionMade {
            run_id: self.state.run_id,
            decision: decision.clone(),
        });

        match decision.verdict {
            Verdict::Continue => self.commit(&plan, &contract, &observation, &inputs),
            Verdict::Retry { backoff_ms, .. } => {
                self.backoff.insert(step_id, backoff_ms);
                Ok(())
            }
            Verdict::Alternate { .. } => {
                let (next, patch) = self.patcher()?.apply_alternate(&step_id)?;
                self.after_patch(&next, patch);
                Ok(())
            }
            Verdict::Replan { hint } => self.replan(Some(step_id), hint).await,
            Verdict::Escalate { trigger, severity } => {
                let outcome = self
                    .escalate(Some(step_id), trigger, severity, decision.rationale)
                    .await;
                let acceptable = observation.success
                    && !matches!(
                        trigger,
                        EscalationTrigger::BudgetExceeded | EscalationTrigger::GateTripped
                    );
                if outcome.action == EscalationAction::Log && acceptable {
                    // low severity: logged, the result stands
                    self.commit(&plan, &contract, &observation, &inputs)
                } else {
                    self.settle(&outcome, "step could not be completed")
                }
            }
        }
    }

    /// Checkpoint, record provenance and schedule retrospects
    fn commit(
        &mut self,
        plan: &Plan,
        contract: &ActionContract,
        observation: &Observation,
        inputs: &Outputs,
    ) -> Result<(), EngineError> {
        let step_id = &contract.id;
        let input_artifacts: Vec<ContentHash> =
            upstream_artifacts(plan, contract, &self.state).into_values().collect();
        let artifact = ArtifactSource {
            step_id,
            capability: &observation.capability,
            capability_version: &observation.capability_version,
            resolved_inputs: inputs,
            input_artifacts: &input_artifacts,
            outputs: &observation.outputs,
        }
        .artifact_hash()?;

        let address = Checkpoint::address(step_id, &artifact);
        let supersedes = self
            .checkpoints
            .latest(step_id)
            .map(|c| c.id)
            .filter(|id| *id != address);
        let checkpoint = self.checkpoints.commit(Checkpoint::new(
            step_id.clone(),
            plan.version,
            artifact,
            observation.outputs.clone(),
            supersedes,
        ));
        self.lineage.record(Provenance {
            artifact,
            step_id: step_id.clone(),
            inputs: input_artifacts,
            capability: observation.capability.clone(),
            capability_version: observation.capability_version.clone(),
            checkpoint: checkpoint.id,
        })?;
        self.state.complete(
            step_id.clone(),
            observation.outputs.clone(),
            artifact,
            checkpoint.id,
        );
        self.backoff.remove(step_id);
        self.events.emit(&RunEvent::CheckpointCommitted {
            run_id: self.state.run_id,
            checkpoint: checkpoint.id,
            step_id: step_id.clone(),
            artifact,
            plan_version: plan.version,
        });

        let brief = self.brief()?;
        let mut jobs = Vec::with_capacity(contract.retrospects.len());
        for spec in &contract.retrospects {
            let job = RetrospectJob::from_spec(
                spec,
                step_id.clone(),
                checkpoint.id,
                artifact,
                self.runner.default_timeout_ms(),
            );
            let snapshot = RetroSnapshot {
                run_id: self.state.run_id,
                inputs: brief.inputs.clone(),
                steps: self.state.outputs.clone(),
                outputs: observation.outputs.clone(),
            };
            jobs.push(self.runner.schedule(job, snapshot));
        }
        self.scheduled.insert(step_id.clone(), jobs);

        self.resolve_replayed_tickets(plan);
        Ok(())
    }

    /// Close tickets whose affected steps have all been committed again
    fn resolve_replayed_tickets(&mut self, plan: &Plan) {
        for ticket in &mut self.tickets {
            if ticket.status != TicketStatus::Replaying {
                continue;
            }
            let replayed = ticket
                .affected_steps
                .iter()
                .filter(|s| plan.contains(s))
                .all(|s| self.state.completed.contains(s));
            if replayed {
                self.replay.resolve(ticket);
                self.state.open_tickets.remove(&ticket.id);
                self.events.emit(&RunEvent::TicketResolved {
                    run_id: self.state.run_id,
                    ticket_id: ticket.id,
                });
            }
        }
    }

    async fn on_retrospect(&mut self, job: RetrospectJob) -> Result<(), EngineError> {
        if !job.status.is_failure() {
            return Ok(());
        }
        let current = self
            .scheduled
            .get(&job.step_id)
            .is_some_and(|jobs| jobs.contains(&job.id))
            && self.state.artifacts.get(&job.step_id) == Some(&job.artifact);
        if !current {
            debug!(job_id = %job.id, step_id = %job.step_id, "ignoring retrospect on superseded artifact");
            return Ok(());
        }

        let plan = self.plan()?;
        let replays = {
            let n = self.replays.entry(job.step_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let retro_failed = self
            .escalate(
                Some(job.step_id.clone()),
                EscalationTrigger::RetrospectFailed,
                self.router.classify(EscalationTrigger::RetrospectFailed),
                format!("retrospect `{}` on `{}` ended {}", job.name, job.step_id, job.status),
            )
            .await;
        if replays > self.policy.replan.max_replans {
            let outcome = self
                .escalate(
                    Some(job.step_id.clone()),
                    EscalationTrigger::ReplanLimit,
                    self.router.classify(EscalationTrigger::ReplanLimit),
                    format!(
                        "`{}` replayed {} times and its retrospects still fail",
                        job.step_id,
                        replays - 1
                    ),
                )
                .await;
            return self.settle(&outcome, "replay limit reached");
        }

        let mut ticket = self.replay.open_ticket(&job, &plan, &self.state);
        self.state.open_tickets.insert(ticket.id);
        self.events.emit(&RunEvent::TicketIssued {
            run_id: self.state.run_id,
            ticket: ticket.clone(),
        });

        // nothing that builds on the invalidated work may keep running
        let mut doomed: BTreeSet<StepId> = ticket.affected_steps.clone();
        for step in &ticket.affected_steps {
            doomed.extend(plan.descendants(step));
        }
        for (step, flight) in &self.running {
            if doomed.contains(step) {
                flight.cancel.cancel();
            }
        }
        self.runner.cancel_for(&ticket.invalidated);

        let records = self.replay.compensate(&mut ticket, &plan, &self.state).await;
        for record in &records {
            self.events.emit(&RunEvent::CompensationRan {
                run_id: self.state.run_id,
                record: record.clone(),
            });
        }
        self.compensations.extend(records);

        if ticket.status == TicketStatus::Failed {
            let message = format!("compensation for ticket {} failed", ticket.id);
            self.tickets.push(ticket);
            let outcome = self
                .escalate(
                    Some(job.step_id.clone()),
                    EscalationTrigger::CompensationFailed,
                    self.router.classify(EscalationTrigger::CompensationFailed),
                    message,
                )
                .await;
            return self.settle(&outcome, "compensation failed");
        }

        self.state.rewind(&ticket.affected_steps);
        for step in &ticket.affected_steps {
            self.scheduled.remove(step);
        }
        info!(
            ticket_id = %ticket.id,
            replay_from = %ticket.replay_from,
            resume = ?ticket.resume_checkpoint,
            "replaying invalidated branch"
        );
        self.tickets.push(ticket);

        if self.state.status == RunStatus::PendingVerification {
            self.set_status(RunStatus::Running)?;
        }
        match retro_failed.action {
            EscalationAction::Log => Ok(()),
            EscalationAction::Pause | EscalationAction::Halt => self.apply_escalation(&retro_failed),
        }
    }

    /// All steps are committed: enforce promotion gates, then final acceptance
    async fn promote(&mut self) -> Result<(), EngineError> {
        let plan = self.plan()?;
        if !self.state.all_complete(&plan) {
            return Err(EngineError::Internal(
                "no step is runnable but the plan is incomplete".into(),
            ));
        }

        let mut waiting = self.gate_waiting(&plan);
        if !waiting.is_empty() {
            if self.state.status == RunStatus::Running {
                self.set_status(RunStatus::PendingVerification)?;
            }
            self.events.emit(&RunEvent::PromotionHeld {
                run_id: self.state.run_id,
                waiting_on: waiting.clone(),
            });
            let deadline = tokio::time::Instant::now()
                + Duration::from_millis(self.policy.timeouts.promotion_wait_ms);
            while !waiting.is_empty() {
                match tokio::time::timeout_at(deadline, self.retro_rx.recv()).await {
                    Ok(Some(job)) => {
                        self.on_retrospect(job).await?;
                        if self.state.status != RunStatus::PendingVerification {
                            return Ok(());
                        }
                        waiting = self.gate_waiting(&plan);
                    }
                    Ok(None) => {
                        return Err(EngineError::Internal("retrospect channel closed".into()))
                    }
                    Err(_) => {
                        info!(
                            run_id = %self.state.run_id,
                            waiting = waiting.len(),
                            "promotion held pending verification"
                        );
                        return Ok(());
                    }
                }
            }
        }

        self.finalize(&plan).await
    }

    /// Retrospect jobs that must still reach `ok` before promotion
    fn gate_waiting(&self, plan: &Plan) -> Vec<JobId> {
        plan.steps
            .iter()
            .filter(|s| s.requires_retro_green)
            .flat_map(|s| self.scheduled.get(&s.id).into_iter().flatten())
            .filter(|id| self.runner.status(id) != Some(JobStatus::Ok))
            .copied()
            .collect()
    }

    async fn finalize(&mut self, plan: &Plan) -> Result<(), EngineError> {
        let brief = self.brief()?;
        let order = plan.topological_order();
        let result = Verifier::final_outputs(&order, &self.state.outputs);
        let checks = self.verifier.verify_final(&brief, &self.state.outputs, &result);
        let failed: Vec<&str> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        let reason = format!("final acceptance failed: {}", failed.join(", "));
        let passed = failed.is_empty();
        self.final_acceptance = checks;

        if passed {
            self.set_status(RunStatus::Done)?;
            self.result = Some(result);
            self.events.emit(&RunEvent::PromotionGranted {
                run_id: self.state.run_id,
                plan_version: plan.version,
            });
            self.runner.cancel_all();
            info!(run_id = %self.state.run_id, plan_version = plan.version, "result promoted");
            return Ok(());
        }

        warn!(run_id = %self.state.run_id, %reason, "final acceptance failed");
        if self.state.status == RunStatus::PendingVerification {
            self.set_status(RunStatus::Running)?;
        }
        if self.state.replans < self.policy.replan.max_replans {
            return self.replan(order.last().cloned(), reason).await;
        }
        let outcome = self
            .escalate(
                None,
                EscalationTrigger::AcceptanceFailed,
                self.router.classify(EscalationTrigger::AcceptanceFailed),
                reason,
            )
            .await;
        self.settle(&outcome, "final acceptance failed")
    }

    async fn replan(&mut self, step: Option<StepId>, reason: String) -> Result<(), EngineError> {
        let plan = self.plan()?;
        let request = ReplanRequest {
            step_id: step.clone(),
            reason: reason.clone(),
        };
        match self.planner.replan(&plan, &self.state, &request).await {
            Ok(ops) => {
                let (next, patch) = self.patcher()?.propose(ops, format!("replan: {reason}"))?;
                self.state.replans += 1;

                // committed steps the patch rewrote run again, with everything after them
                let mut rewind = BTreeSet::new();
                for id in patch.touched_steps() {
                    if self.state.completed.contains(id) {
                        rewind.insert(id.clone());
                        if next.contains(id) {
                            rewind.extend(next.descendants(id));
                        }
                    }
                }
                rewind.retain(|s| self.state.completed.contains(s));
                self.state.rewind(&rewind);
                for step in &rewind {
                    self.scheduled.remove(step);
                }
                self.after_patch(&next, patch);
                Ok(())
            }
            Err(PlannerError::CapabilityMissing(missing)) => {
                let outcome = self
                    .escalate(
                        step,
                        EscalationTrigger::CapabilityMissing,
                        missing.severity,
                        missing.to_string(),
                    )
                    .await;
                self.settle(&outcome, "replan needs a missing capability")
            }
            Err(e) => {
                let outcome = self
                    .escalate(
                        step,
                        EscalationTrigger::RetriesExhausted,
                        self.router.classify(EscalationTrigger::RetriesExhausted),
                        format!("replan failed: {e}"),
                    )
                    .await;
                self.settle(&outcome, "replan failed")
            }
        }
    }

    fn after_patch(&mut self, next: &Plan, patch: PlanPatch) {
        self.state.plan_version = next.version;
        for id in patch.touched_steps() {
            self.state.reset_attempts(id);
            self.backoff.remove(id);
            if let Some(flight) = self.running.get(id) {
                flight.cancel.cancel();
            }
        }
        self.events.emit(&RunEvent::PlanPatched {
            run_id: self.state.run_id,
            patch,
        });
    }

    async fn escalate(
        &mut self,
        step_id: Option<StepId>,
        trigger: EscalationTrigger,
        severity: Severity,
        message: String,
    ) -> EscalationOutcome {
        let payload = EscalationPayload {
            run_id: self.state.run_id,
            step_id: step_id.clone(),
            trigger,
            severity,
            message,
            plan_version: self.state.plan_version,
        };
        let outcome = self.router.route(payload).await;
        self.events.emit(&RunEvent::EscalationRouted {
            run_id: self.state.run_id,
            step_id,
            trigger,
            severity,
            delivered: outcome.acks.len(),
        });
        self.escalations.push(outcome.clone());
        outcome
    }

    /// Pause or halt per the outcome; a logged escalation fails the run
    fn settle(&mut self, outcome: &EscalationOutcome, reason: &str) -> Result<(), EngineError> {
        match outcome.action {
            EscalationAction::Log => {
                error!(run_id = %self.state.run_id, %reason, "run failed");
                self.stop_work();
                self.set_status(RunStatus::Failed)
            }
            EscalationAction::Pause | EscalationAction::Halt => self.apply_escalation(outcome),
        }
    }

    fn apply_escalation(&mut self, outcome: &EscalationOutcome) -> Result<(), EngineError> {
        let to = match outcome.action {
            EscalationAction::Log => return Ok(()),
            EscalationAction::Pause => RunStatus::Paused,
            EscalationAction::Halt => RunStatus::Escalated,
        };
        for flight in self.running.values() {
            flight.cancel.cancel();
        }
        self.acknowledged = false;
        self.set_status(to)
    }

    fn stop_work(&mut self) {
        for flight in self.running.values() {
            flight.cancel.cancel();
        }
        self.runner.cancel_all();
    }

    fn set_status(&mut self, to: RunStatus) -> Result<(), EngineError> {
        let from = self.state.transition(to)?;
        if from != to {
            self.events.emit(&RunEvent::StatusChanged {
                run_id: self.state.run_id,
                from,
                to,
            });
        }
        Ok(())
    }

    fn abort(&mut self, err: EngineError) -> Result<RunReport, EngineError> {
        error!(run_id = %self.state.run_id, error = %err, "run aborted");
        self.stop_work();
        if !self.state.status.is_terminal() {
            let from = self.state.status;
            if self.state.transition(RunStatus::Failed).is_ok() {
                self.events.emit(&RunEvent::StatusChanged {
                    run_id: self.state.run_id,
                    from,
                    to: RunStatus::Failed,
                });
            }
        }
        Err(err)
    }

    fn plan(&self) -> Result<Arc<Plan>, EngineError> {
        self.current_plan()
            .ok_or_else(|| EngineError::Internal("no plan has been generated".into()))
    }

    fn patcher(&self) -> Result<&PlanPatcher, EngineError> {
        self.patcher
            .as_ref()
            .ok_or_else(|| EngineError::Internal("no plan has been generated".into()))
    }

    fn brief(&self) -> Result<Arc<TaskBrief>, EngineError> {
        self.brief
            .clone()
            .ok_or_else(|| EngineError::Internal("no brief has been submitted".into()))
    }
}

/// Current artifacts of the steps a contract builds on
fn upstream_artifacts(
    plan: &Plan,
    contract: &ActionContract,
    state: &RunState,
) -> BTreeMap<StepId, ContentHash> {
    plan.dependencies_of(&contract.id)
        .iter()
        .cloned()
        .chain(contract.input_references())
        .filter_map(|step| state.artifacts.get(&step).map(|hash| (step, *hash)))
        .collect()
}
