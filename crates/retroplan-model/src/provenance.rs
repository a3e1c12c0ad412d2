//! Provenance records and checkpoints
//!
//! Both are immutable once created. Their addresses depend only on
//! content, never on wall-clock time, so replaying a branch with the same
//! inputs through the same capabilities reproduces the same hashes.

use crate::hash::{ContentHash, HashError};
use crate::ids::{CapabilityId, CheckpointId, StepId};
use crate::Outputs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ARTIFACT_DOMAIN: &str = "retroplan.artifact.v1";
const CHECKPOINT_DOMAIN: &str = "retroplan.checkpoint.v1";

/// Origin of one produced artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub artifact: ContentHash,
    pub step_id: StepId,
    /// Artifacts this one was derived from, sorted
    pub inputs: Vec<ContentHash>,
    pub capability: CapabilityId,
    pub capability_version: String,
    pub checkpoint: CheckpointId,
}

/// Everything that determines an artifact's address
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSource<'a> {
    pub step_id: &'a StepId,
    pub capability: &'a CapabilityId,
    pub capability_version: &'a str,
    pub resolved_inputs: &'a Outputs,
    pub input_artifacts: &'a [ContentHash],
    pub outputs: &'a Outputs,
}

impl ArtifactSource<'_> {
    /// Content address of the produced artifact
    ///
    /// # Errors
    /// Returns error if inputs or outputs fail to serialize
    pub fn artifact_hash(&self) -> Result<ContentHash, HashError> {
        let inputs = serde_json::to_vec(self.resolved_inputs)?;
        let outputs = serde_json::to_vec(self.outputs)?;
        let mut upstream: Vec<ContentHash> = self.input_artifacts.to_vec();
        upstream.sort();
        upstream.dedup();
        let upstream: Vec<u8> = upstream.iter().flat_map(|h| h.as_bytes().to_vec()).collect();
        Ok(ContentHash::derive(
            ARTIFACT_DOMAIN,
            &[
                self.step_id.as_str().as_bytes(),
                self.capability.as_str().as_bytes(),
                self.capability_version.as_bytes(),
                &inputs,
                &upstream,
                &outputs,
            ],
        ))
    }
}

/// Immutable, replay-restartable snapshot after a successful step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub step_id: StepId,
    pub plan_version: u64,
    pub artifact: ContentHash,
    pub outputs: Outputs,
    /// Earlier checkpoint of the same step this one replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<CheckpointId>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Address of a checkpoint for `step` holding `artifact`
    #[must_use]
    pub fn address(step_id: &StepId, artifact: &ContentHash) -> CheckpointId {
        CheckpointId(ContentHash::derive(
            CHECKPOINT_DOMAIN,
            &[step_id.as_str().as_bytes(), artifact.as_bytes()],
        ))
    }

    /// Snapshot a step's committed outputs
    #[must_use]
    pub fn new(
        step_id: StepId,
        plan_version: u64,
        artifact: ContentHash,
        outputs: Outputs,
        supersedes: Option<CheckpointId>,
    ) -> Self {
        Self {
            id: Self::address(&step_id, &artifact),
            step_id,
            plan_version,
            artifact,
            outputs,
            supersedes,
            created_at: Utc::now(),
        }
    }
}
