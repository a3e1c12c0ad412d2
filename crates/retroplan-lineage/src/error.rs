//! Lineage errors

use retroplan_model::{ContentHash, StepId};

/// Rejected lineage writes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineageError {
    /// An input artifact was never recorded
    #[error("artifact {artifact} produced by {step} references unknown input {input}")]
    UnknownInput {
        artifact: ContentHash,
        step: StepId,
        input: ContentHash,
    },

    /// The same hash was recorded with different provenance
    #[error("conflicting provenance for artifact {0}")]
    Conflict(ContentHash),

    /// An artifact may not list itself as an input
    #[error("artifact {0} lists itself as an input")]
    SelfReference(ContentHash),
}
