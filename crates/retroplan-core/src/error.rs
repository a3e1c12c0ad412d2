//! Error types for the execution engine
//!
//! Only programmer and contract errors live here: malformed plans,
//! unresolvable bindings, unknown capabilities, stale patches, corrupt
//! audit chains. Capability failures, drift, gate trips and retrospect
//! failures are data (observations, decisions, tickets) and never surface
//! as one of these.

use retroplan_lineage::LineageError;
use retroplan_model::{
    CapabilityId, HashError, PlanError, PolicyError, RunStatus, Severity, StepId, TransitionError,
};

/// An input binding that cannot be resolved
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    /// TaskBrief has no such input
    #[error("task input `{0}` is not defined")]
    MissingInput(String),

    /// The referenced step has not produced the key
    #[error("step `{step}` has no output `{key}`")]
    MissingOutput { step: StepId, key: String },

    /// Placeholder path has no step or key segment
    #[error("malformed reference path `{0}`")]
    InvalidPath(String),
}

/// Executor failures that abort the run
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No capability registered under this id
    #[error("unknown capability: {0}")]
    UnknownCapability(CapabilityId),

    /// Inputs could not be bound
    #[error("binding failed: {0}")]
    Binding(#[from] BindingError),
}

/// Plan patcher failures
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Patch does not derive from the current version
    #[error("version conflict: patch derives from {actual}, current is {expected}")]
    VersionConflict { expected: u64, actual: u64 },

    /// Patched plan is invalid
    #[error("invalid patch: {0}")]
    Plan(#[from] PlanError),

    /// Decision carries nothing to patch
    #[error("decision for `{0}` does not translate to a patch")]
    NotPatchable(StepId),
}

/// Referenced capabilities are not registered
///
/// Raised by the planner before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("candidate `{candidate}` references missing capabilities: {}", format_ids(.missing))]
pub struct CapabilityMissingError {
    pub candidate: String,
    pub missing: Vec<CapabilityId>,
    pub severity: Severity,
}

fn format_ids(ids: &[CapabilityId]) -> String {
    ids.iter().map(CapabilityId::as_str).collect::<Vec<_>>().join(", ")
}

/// Planner failures
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// No candidate met the feasibility floor
    #[error("no feasible candidate for objective `{0}`")]
    NoCandidates(String),

    #[error(transparent)]
    CapabilityMissing(#[from] CapabilityMissingError),

    /// Proposed plan or patch is structurally invalid
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    /// The external proposer failed
    #[error("proposer failed: {0}")]
    Proposer(String),
}

/// Audit chain failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Record hash or back-link does not match
    #[error("audit chain broken at record {0}")]
    IntegrityViolation(u64),

    #[error("failed to encode event: {0}")]
    Encoding(String),
}

/// Top-level engine error
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("state machine error: {0}")]
    Transition(#[from] TransitionError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// Operation not allowed in the current run status
    #[error("run is {status}, cannot {action}")]
    InvalidState {
        status: RunStatus,
        action: &'static str,
    },

    /// An escalated run needs operator acknowledgement first
    #[error("escalated run requires acknowledgement before resuming")]
    NotAcknowledged,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the run could be retried after fixing inputs
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Internal(_) | Self::Policy(_) | Self::Hash(_) => false,
            Self::Audit(AuditError::IntegrityViolation(_)) => false,
            Self::Plan(_)
            | Self::Binding(_)
            | Self::Executor(_)
            | Self::Patch(_)
            | Self::Planner(_)
            | Self::Lineage(_)
            | Self::Transition(_)
            | Self::Audit(_)
            | Self::InvalidState { .. }
            | Self::NotAcknowledged => true,
        }
    }

    /// Corruption or misconfiguration of the engine itself
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        matches!(
            self,
            Self::Internal(_)
                | Self::Hash(_)
                | Self::Lineage(_)
                | Self::Audit(AuditError::IntegrityViolation(_))
        )
    }

    /// Whether an operator should be paged
    #[must_use]
    pub fn should_escalate(&self) -> bool {
        self.is_system_error()
            || matches!(
                self,
                Self::Planner(PlannerError::CapabilityMissing(_)) | Self::NotAcknowledged
            )
    }
}
