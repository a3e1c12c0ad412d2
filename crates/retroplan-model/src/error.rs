//! Error types for the data model
//!
//! Everything here is a programmer/contract error: a malformed plan or a
//! patch that does not derive from the version it claims to.

use crate::ids::{PlanId, StepId};

/// Plan construction and patch application errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Plan has no steps
    #[error("plan has no steps")]
    Empty,

    /// Two steps share an id
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    /// Step id is empty, contains '.', or uses a reserved name
    #[error("invalid step id: {0:?}")]
    InvalidStepId(StepId),

    /// Dependency map names a step that does not exist
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    /// Dependency map has an entry for an unknown step
    #[error("dependencies declared for unknown step {0}")]
    UnknownStep(StepId),

    /// Step lists itself as a dependency
    #[error("step {0} depends on itself")]
    SelfDependency(StepId),

    /// Dependency graph is cyclic
    #[error("dependency cycle through {0}")]
    Cycle(StepId),

    /// Binding reads a step that is not an ancestor
    #[error("step {step} binds output of {referenced}, which is not one of its dependencies")]
    DanglingReference { step: StepId, referenced: StepId },

    /// Assertion is malformed
    #[error("step {step}: {detail}")]
    InvalidAssertion { step: StepId, detail: String },

    /// Patch applied to the wrong plan
    #[error("patch for plan {patch} applied to plan {plan}")]
    PlanMismatch { plan: PlanId, patch: PlanId },

    /// Patch does not derive from the current version
    #[error("patch derives from version {from}, plan is at version {current}")]
    VersionMismatch { current: u64, from: u64 },

    /// Patch skips or reuses a version number
    #[error("patch must target version {expected}, got {actual}")]
    VersionGap { expected: u64, actual: u64 },

    /// Patch adds a step id that already exists
    #[error("step {0} already exists")]
    StepExists(StepId),
}
