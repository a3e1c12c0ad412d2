//! Invalidation, compensation and replay planning
//!
//! A failed retrospect becomes an [`InvalidationTicket`]: the exact lineage
//! downstream of the failing artifact, the steps and checkpoints that
//! produced it, the undo actions to run, and where replay restarts.
//! Compensation is data executed in strict reverse order; a failed undo
//! stops the saga and fails the ticket so it can be escalated.

use crate::binding::resolve_inputs;
use crate::capability::ExecutionContext;
use crate::executor::Executor;
use chrono::Utc;
use retroplan_lineage::LineageGraph;
use retroplan_model::{
    CompensationRecord, InvalidationTicket, Plan, PolicyConfig, RetrospectJob, RunState, Scope,
    StepId, TicketId, TicketStatus,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Turns failed retrospects into tickets and executes their compensation
#[derive(Debug, Clone)]
pub struct ReplayManager {
    lineage: Arc<LineageGraph>,
    executor: Executor,
    policy: Arc<PolicyConfig>,
}

impl ReplayManager {
    #[must_use]
    pub fn new(lineage: Arc<LineageGraph>, executor: Executor, policy: Arc<PolicyConfig>) -> Self {
        Self {
            lineage,
            executor,
            policy,
        }
    }

    /// Compute the blast radius of a failed job and invalidate it
    ///
    /// The root is the current artifact of the job's `replay_from` step
    /// (the job's own step by default). Everything downstream of the root
    /// is invalidated unless the job opted out, in which case only the
    /// root is.
    #[must_use]
    pub fn open_ticket(
        &self,
        job: &RetrospectJob,
        plan: &Plan,
        state: &RunState,
    ) -> InvalidationTicket {
        let replay_from = job
            .on_fail
            .replay_from
            .clone()
            .filter(|step| plan.contains(step))
            .unwrap_or_else(|| job.step_id.clone());
        let root = state
            .artifacts
            .get(&replay_from)
            .copied()
            .unwrap_or(job.artifact);

        let invalidated = if job.on_fail.invalidate_downstream {
            self.lineage.downstream_of(&root)
        } else {
            BTreeSet::from([root])
        };
        let id = TicketId::new();
        let marked = self.lineage.invalidate(id, &invalidated);

        let mut affected_steps: BTreeSet<StepId> = state
            .artifacts
            .iter()
            .filter(|(_, hash)| invalidated.contains(hash))
            .map(|(step, _)| step.clone())
            .collect();
        affected_steps.insert(replay_from.clone());
        let affected_checkpoints = affected_steps
            .iter()
            .filter_map(|step| state.checkpoints.get(step).copied())
            .collect();
        let compensations = plan
            .topological_order()
            .into_iter()
            .filter(|step| affected_steps.contains(step) && state.completed.contains(step))
            .filter(|step| plan.step(step).is_some_and(|c| c.is_compensable()))
            .collect::<Vec<_>>();
        let resume_checkpoint = self
            .lineage
            .find_earliest_valid_ancestor(&root)
            .map(|p| p.checkpoint);

        let reason = if job.failures.is_empty() {
            format!("retrospect `{}` {}", job.name, job.status)
        } else {
            let details: Vec<_> = job
                .failures
                .iter()
                .map(|f| match &f.detail {
                    Some(detail) => format!("{}: {detail}", f.name),
                    None => f.name.clone(),
                })
                .collect();
            format!("retrospect `{}` {}: {}", job.name, job.status, details.join("; "))
        };

        info!(
            ticket_id = %id,
            job_id = %job.id,
            replay_from = %replay_from,
            invalidated = invalidated.len(),
            newly_marked = marked,
            compensations = compensations.len(),
            "invalidation ticket opened"
        );

        InvalidationTicket {
            id,
            job_id: job.id,
            origin_step: job.step_id.clone(),
            target_artifact: root,
            invalidated,
            affected_steps,
            affected_checkpoints,
            compensations,
            replay_from,
            resume_checkpoint,
            status: TicketStatus::Open,
            reason,
            created_at: Utc::now(),
        }
    }

    /// Run the ticket's undo actions, newest step first
    ///
    /// Must run before the affected steps are rewound, since undo bindings
    /// may read the step's own outputs. Leaves the ticket `Replaying` on
    /// success and `Failed` at the first failed undo.
    pub async fn compensate(
        &self,
        ticket: &mut InvalidationTicket,
        plan: &Plan,
        state: &RunState,
    ) -> Vec<CompensationRecord> {
        ticket.status = TicketStatus::Compensating;
        let mut records = Vec::new();

        for step_id in ticket.compensations.iter().rev() {
            let Some(contract) = plan.step(step_id) else {
                continue;
            };
            let own = state.outputs.get(step_id).cloned().unwrap_or_default();
            let scope = Scope::new(&plan.brief.inputs, &state.outputs).with_local(&own);

            for undo in contract.compensation.iter().rev() {
                let result = match resolve_inputs(&undo.inputs, &scope) {
                    Ok(inputs) => {
                        let ctx = ExecutionContext::new(step_id.clone(), self.policy.timeouts.step_ms);
                        self.executor
                            .invoke(step_id, &undo.capability, &inputs, &ctx)
                            .await
                            .map_err(|e| e.to_string())
                            .and_then(|obs| {
                                if obs.success {
                                    Ok(())
                                } else {
                                    Err(obs
                                        .error
                                        .map_or_else(|| "undo failed".to_string(), |e| e.message))
                                }
                            })
                    }
                    Err(e) => Err(e.to_string()),
                };

                let record = CompensationRecord {
                    ticket_id: ticket.id,
                    step_id: step_id.clone(),
                    capability: undo.capability.clone(),
                    success: result.is_ok(),
                    error: result.err(),
                    ran_at: Utc::now(),
                };
                let failed = !record.success;
                if failed {
                    warn!(
                        ticket_id = %ticket.id,
                        step_id = %step_id,
                        capability = %undo.capability,
                        error = record.error.as_deref().unwrap_or(""),
                        "compensation failed"
                    );
                }
                records.push(record);
                if failed {
                    ticket.status = TicketStatus::Failed;
                    return records;
                }
            }
        }

        ticket.status = TicketStatus::Replaying;
        records
    }

    /// Close a replayed ticket, making its artifacts valid again
    pub fn resolve(&self, ticket: &mut InvalidationTicket) -> usize {
        ticket.status = TicketStatus::Resolved;
        let released = self.lineage.close_ticket(ticket.id);
        info!(ticket_id = %ticket.id, released, "invalidation ticket resolved");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        CapabilityFailure, CapabilityRegistry, CapabilityResponse, Tool,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use retroplan_model::{
        ActionContract, ArtifactSource, Binding, Checkpoint, CheckpointId, ContentHash, JobStatus,
        OnFailPolicy, Outputs, PlanId, Provenance, RetroCheck, RetrospectSpec, RunId, TaskBrief,
        UndoAction,
    };
    use serde_json::json;

    #[derive(Default)]
    struct Undo {
        calls: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Tool for Arc<Undo> {
        async fn invoke(
            &self,
            inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            let id = inputs.get("id").cloned().unwrap_or_default();
            if id == json!("s2-out") {
                return Err(CapabilityFailure::new("row locked"));
            }
            self.calls.lock().push(id);
            Ok(CapabilityResponse::default())
        }
    }

    struct Fixture {
        plan: Plan,
        state: RunState,
        lineage: Arc<LineageGraph>,
        undo: Arc<Undo>,
        manager: ReplayManager,
    }

    fn commit(
        lineage: &LineageGraph,
        state: &mut RunState,
        step: &str,
        inputs: &[ContentHash],
    ) -> ContentHash {
        let step_id = StepId::new(step);
        let outputs: Outputs = serde_json::from_value(json!({"id": format!("{step}-out")})).unwrap();
        let artifact = ArtifactSource {
            step_id: &step_id,
            capability: &"echo".into(),
            capability_version: "",
            resolved_inputs: &Outputs::new(),
            input_artifacts: inputs,
            outputs: &outputs,
        }
        .artifact_hash()
        .unwrap();
        let checkpoint = Checkpoint::address(&step_id, &artifact);
        lineage
            .record(Provenance {
                artifact,
                step_id: step_id.clone(),
                inputs: inputs.to_vec(),
                capability: "echo".into(),
                capability_version: String::new(),
                checkpoint,
            })
            .unwrap();
        state.complete(step_id, outputs, artifact, checkpoint);
        artifact
    }

    /// s1 -> s2 -> s3 with s3 compensable, plus an unrelated s4
    fn fixture(undo_s2: bool) -> (Fixture, [ContentHash; 4]) {
        let undo = Arc::new(Undo::default());
        let mut s2 = ActionContract::new("s2", "two", "echo");
        if undo_s2 {
            s2 = s2.compensated_by(UndoAction::new("undo").bind("id", Binding::output("s2", "id")));
        }
        let plan = Plan::new(
            TaskBrief::new("t"),
            vec![
                ActionContract::new("s1", "one", "echo"),
                s2,
                ActionContract::new("s3", "three", "echo")
                    .compensated_by(UndoAction::new("undo").bind("id", Binding::output("s3", "id"))),
                ActionContract::new("s4", "four", "echo"),
            ],
            std::collections::BTreeMap::from([
                (StepId::new("s2"), vec![StepId::new("s1")]),
                (StepId::new("s3"), vec![StepId::new("s2")]),
            ]),
        )
        .unwrap();
        let lineage = Arc::new(LineageGraph::new());
        let mut state = RunState::new(RunId::new(), PlanId::new());
        let a1 = commit(&lineage, &mut state, "s1", &[]);
        let a2 = commit(&lineage, &mut state, "s2", &[a1]);
        let a3 = commit(&lineage, &mut state, "s3", &[a2]);
        let a4 = commit(&lineage, &mut state, "s4", &[]);

        let registry = CapabilityRegistry::builder()
            .tool("undo", Arc::clone(&undo))
            .build();
        let policy = Arc::new(PolicyConfig::default());
        let executor = Executor::new(Arc::new(registry), Arc::clone(&policy));
        let manager = ReplayManager::new(Arc::clone(&lineage), executor, policy);
        (
            Fixture {
                plan,
                state,
                lineage,
                undo,
                manager,
            },
            [a1, a2, a3, a4],
        )
    }

    fn failed_job(state: &RunState, step: &str, on_fail: OnFailPolicy) -> RetrospectJob {
        let step_id = StepId::new(step);
        let mut job = RetrospectJob::from_spec(
            &RetrospectSpec::new("check", vec![RetroCheck::Schema { required: Default::default() }])
                .on_fail(on_fail),
            step_id.clone(),
            state.checkpoints[&step_id],
            state.artifacts[&step_id],
            1_000,
        );
        job.transition(JobStatus::Running);
        job.transition(JobStatus::Fail);
        job
    }

    #[tokio::test]
    async fn ticket_covers_exactly_the_downstream_branch() {
        let (mut fx, [a1, a2, a3, a4]) = fixture(false);
        let job = failed_job(&fx.state, "s2", OnFailPolicy::default());
        let mut ticket = fx.manager.open_ticket(&job, &fx.plan, &fx.state);

        assert_eq!(ticket.invalidated, BTreeSet::from([a2, a3]));
        assert_eq!(
            ticket.affected_steps,
            BTreeSet::from([StepId::new("s2"), StepId::new("s3")])
        );
        assert_eq!(ticket.compensations, vec![StepId::new("s3")]);
        assert_eq!(ticket.replay_from, StepId::new("s2"));
        assert_eq!(ticket.resume_checkpoint, Some(fx.state.checkpoints[&StepId::new("s1")]));
        assert!(fx.lineage.is_valid(&a1) && fx.lineage.is_valid(&a4));
        assert!(!fx.lineage.is_valid(&a3));

        let records = fx.manager.compensate(&mut ticket, &fx.plan, &fx.state).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(*fx.undo.calls.lock(), vec![json!("s3-out")]);
        assert_eq!(ticket.status, TicketStatus::Replaying);

        fx.state.rewind(&ticket.affected_steps);
        fx.manager.resolve(&mut ticket);
        assert!(fx.lineage.is_valid(&a3));
    }

    #[tokio::test]
    async fn replay_from_earlier_step_widens_the_radius() {
        let (fx, [a1, a2, a3, _]) = fixture(false);
        let job = failed_job(
            &fx.state,
            "s3",
            OnFailPolicy {
                invalidate_downstream: true,
                replay_from: Some("s1".into()),
            },
        );
        let ticket = fx.manager.open_ticket(&job, &fx.plan, &fx.state);
        assert_eq!(ticket.invalidated, BTreeSet::from([a1, a2, a3]));
        assert_eq!(ticket.resume_checkpoint, None::<CheckpointId>);
    }

    #[tokio::test]
    async fn failed_undo_stops_the_saga() {
        let (fx, _) = fixture(true);
        let job = failed_job(&fx.state, "s2", OnFailPolicy::default());
        let mut ticket = fx.manager.open_ticket(&job, &fx.plan, &fx.state);
        assert_eq!(ticket.compensations, vec![StepId::new("s2"), StepId::new("s3")]);

        let records = fx.manager.compensate(&mut ticket, &fx.plan, &fx.state).await;
        // s3 undone first, then s2 fails
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);
        assert_eq!(ticket.status, TicketStatus::Failed);
    }

    #[tokio::test]
    async fn opting_out_of_downstream_invalidation() {
        let (fx, [_, a2, a3, _]) = fixture(false);
        let job = failed_job(
            &fx.state,
            "s2",
            OnFailPolicy {
                invalidate_downstream: false,
                replay_from: None,
            },
        );
        let ticket = fx.manager.open_ticket(&job, &fx.plan, &fx.state);
        assert_eq!(ticket.invalidated, BTreeSet::from([a2]));
        assert!(fx.lineage.is_valid(&a3));
    }
}
