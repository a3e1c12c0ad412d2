//! Retroplan Model - shared data types
//!
//! Immutable and versioned values used across the planner, the execution
//! loop and the retrospective validation path:
//! - Task briefs, action contracts and versioned plans with their patches
//! - Observations, decisions and the run state machine
//! - Content-addressed provenance, checkpoints, retrospect jobs and
//!   invalidation tickets
//! - The policy document every component is configured from
//!
//! Nothing in this crate performs I/O except [`PolicyConfig::from_path`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod assertion;
pub mod brainstorm;
pub mod brief;
pub mod contract;
pub mod decision;
pub mod error;
pub mod hash;
pub mod ids;
pub mod observation;
pub mod patch;
pub mod plan;
pub mod policy;
pub mod provenance;
pub mod retrospect;
pub mod state;
pub mod ticket;

use std::collections::BTreeMap;

/// Named values produced by a step (or supplied as task inputs)
pub type Outputs = BTreeMap<String, serde_json::Value>;

pub use assertion::{Assertion, AssertionFailure, Check, Scope, ValueType, INPUT_NAMESPACE};
pub use brainstorm::{
    BrainstormResult, Candidate, CapabilityCheck, CapabilityKind, CapabilityVerification,
};
pub use brief::{Budget, BudgetDimension, Spend, TaskBrief};
pub use contract::{
    render_template, template_paths, ActionContract, Binding, OnFailPolicy, RetroCheck,
    RetrospectSpec, UndoAction,
};
pub use decision::{Decision, EscalationTrigger, Severity, Verdict};
pub use error::PlanError;
pub use hash::{ContentHash, HashError};
pub use ids::{CapabilityId, CheckpointId, JobId, PlanId, RunId, StepId, TicketId, TraceId};
pub use observation::{
    CheckResult, ContractReport, ContractViolation, FailureKind, Observation, ObservationError,
    VerificationReport, ViolationKind,
};
pub use patch::{PatchOp, PlanPatch};
pub use plan::Plan;
pub use policy::{
    ConfidencePolicy, DriftPolicy, EscalationPolicy, PlannerPolicy, PolicyConfig, PolicyError,
    ReplanPolicy, RetrospectPolicy, RetryPolicy, TimeoutPolicy,
};
pub use provenance::{ArtifactSource, Checkpoint, Provenance};
pub use retrospect::{JobStatus, RetrospectJob};
pub use state::{allowed_transitions, validate_transition, RunState, RunStatus, TransitionError};
pub use ticket::{CompensationRecord, InvalidationTicket, TicketStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
