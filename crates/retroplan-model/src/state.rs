//! Run state and its status state machine

use crate::brief::Spend;
use crate::decision::Decision;
use crate::hash::ContentHash;
use crate::ids::{CheckpointId, PlanId, RunId, StepId, TicketId};
use crate::observation::Observation;
use crate::plan::Plan;
use crate::Outputs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle of one task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Running,
    /// Stopped at a resumable point (S3)
    Paused,
    /// Halted pending operator action (S4)
    Escalated,
    /// All steps done, promotion gate not yet green
    PendingVerification,
    Done,
    Failed,
}

impl RunStatus {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Escalated => "escalated",
            Self::PendingVerification => "pending_verification",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Statuses reachable from `from`
#[must_use]
pub fn allowed_transitions(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::{Done, Escalated, Failed, Paused, PendingVerification, Planning, Running};
    match from {
        Planning => &[Running, Failed],
        Running => &[Paused, Escalated, PendingVerification, Done, Failed],
        Paused => &[Running, Escalated, Failed],
        Escalated => &[Running, Failed],
        PendingVerification => &[Running, Paused, Escalated, Done, Failed],
        Done | Failed => &[],
    }
}

/// Rejected status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal run transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Validate a status change
///
/// # Errors
/// Returns error if `to` is not reachable from `from`
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// The single authoritative state of one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub plan_version: u64,
    pub status: RunStatus,
    /// Steps whose current outputs are committed
    #[serde(default)]
    pub completed: BTreeSet<StepId>,
    #[serde(default)]
    pub outputs: BTreeMap<StepId, Outputs>,
    #[serde(default)]
    pub artifacts: BTreeMap<StepId, ContentHash>,
    #[serde(default)]
    pub checkpoints: BTreeMap<StepId, CheckpointId>,
    /// Attempts of each step's current contract
    #[serde(default)]
    pub attempts: BTreeMap<StepId, u32>,
    #[serde(default)]
    pub spend: Spend,
    #[serde(default)]
    pub history: Vec<Observation>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub replans: u32,
    #[serde(default)]
    pub open_tickets: BTreeSet<TicketId>,
}

impl RunState {
    /// Fresh state in `planning`
    #[must_use]
    pub fn new(run_id: RunId, plan_id: PlanId) -> Self {
        Self {
            run_id,
            plan_id,
            plan_version: 0,
            status: RunStatus::Planning,
            completed: BTreeSet::new(),
            outputs: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            attempts: BTreeMap::new(),
            spend: Spend::default(),
            history: Vec::new(),
            decisions: Vec::new(),
            replans: 0,
            open_tickets: BTreeSet::new(),
        }
    }

    /// Change status through the state machine
    ///
    /// # Errors
    /// Returns error on an illegal transition
    pub fn transition(&mut self, to: RunStatus) -> Result<RunStatus, TransitionError> {
        if self.status == to {
            return Ok(to);
        }
        validate_transition(self.status, to)?;
        let from = self.status;
        self.status = to;
        Ok(from)
    }

    /// Attempts made so far with the step's current contract
    #[must_use]
    pub fn attempts(&self, step: &StepId) -> u32 {
        self.attempts.get(step).copied().unwrap_or(0)
    }

    /// Start a new attempt; returns its 1-based number
    pub fn begin_attempt(&mut self, step: &StepId) -> u32 {
        let n = self.attempts.entry(step.clone()).or_insert(0);
        *n += 1;
        *n
    }

    /// Forget attempts (after an alternate or replan swaps the contract)
    pub fn reset_attempts(&mut self, step: &StepId) {
        self.attempts.remove(step);
    }

    /// Record an observation and account its spend
    pub fn record(&mut self, observation: Observation) {
        self.spend = self.spend.plus(
            observation.cost,
            observation.duration_ms,
            observation.attempt > 1,
        );
        self.history.push(observation);
    }

    /// Commit a step's outputs
    pub fn complete(
        &mut self,
        step: StepId,
        outputs: Outputs,
        artifact: ContentHash,
        checkpoint: CheckpointId,
    ) {
        self.outputs.insert(step.clone(), outputs);
        self.artifacts.insert(step.clone(), artifact);
        self.checkpoints.insert(step.clone(), checkpoint);
        self.completed.insert(step);
    }

    /// Roll the given steps back to not-yet-run
    pub fn rewind<'a>(&mut self, steps: impl IntoIterator<Item = &'a StepId>) {
        for step in steps {
            self.completed.remove(step);
            self.outputs.remove(step);
            self.artifacts.remove(step);
            self.checkpoints.remove(step);
            self.attempts.remove(step);
        }
    }

    /// Steps ready to run under `plan`
    #[must_use]
    pub fn frontier(&self, plan: &Plan) -> Vec<StepId> {
        plan.ready_steps(&self.completed, &BTreeSet::new())
    }

    /// Every step of `plan` is committed
    #[must_use]
    pub fn all_complete(&self, plan: &Plan) -> bool {
        plan.steps.iter().all(|s| self.completed.contains(&s.id))
    }

    /// Step owning an artifact hash
    #[must_use]
    pub fn step_for_artifact(&self, artifact: &ContentHash) -> Option<&StepId> {
        self.artifacts
            .iter()
            .find_map(|(step, hash)| (hash == artifact).then_some(step))
    }
}
