//! Invalidation tickets and compensation records

use crate::hash::ContentHash;
use crate::ids::{CapabilityId, CheckpointId, JobId, StepId, TicketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Progress of a ticket through the replay manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Compensating,
    Replaying,
    Resolved,
    /// A compensation failed; the ticket was escalated
    Failed,
}

/// Produced when a retrospect fails: what to undo and where to restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationTicket {
    pub id: TicketId,
    pub job_id: JobId,
    /// Step whose retrospect failed
    pub origin_step: StepId,
    /// Artifact the invalidation is rooted at
    pub target_artifact: ContentHash,
    /// Exactly the lineage downstream of the target (inclusive)
    pub invalidated: BTreeSet<ContentHash>,
    pub affected_steps: BTreeSet<StepId>,
    pub affected_checkpoints: BTreeSet<CheckpointId>,
    /// Steps whose compensation must run, in execution order (reversed when run)
    pub compensations: Vec<StepId>,
    /// Step the replay restarts at
    pub replay_from: StepId,
    /// Checkpoint the replay resumes from; `None` replays from the start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_checkpoint: Option<CheckpointId>,
    pub status: TicketStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl InvalidationTicket {
    /// Whether the ticket still blocks its artifacts
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self.status, TicketStatus::Resolved | TicketStatus::Failed)
    }

    /// Whether `artifact` is covered by this ticket
    #[must_use]
    pub fn covers(&self, artifact: &ContentHash) -> bool {
        self.invalidated.contains(artifact)
    }
}

/// Outcome of one undo action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub ticket_id: TicketId,
    pub step_id: StepId,
    pub capability: CapabilityId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ran_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_tickets_are_closed() {
        let artifact = ContentHash::compute(b"a");
        let mut ticket = InvalidationTicket {
            id: TicketId::new(),
            job_id: JobId::new(),
            origin_step: StepId::new("s2"),
            target_artifact: artifact,
            invalidated: BTreeSet::from([artifact]),
            affected_steps: BTreeSet::from([StepId::new("s2")]),
            affected_checkpoints: BTreeSet::new(),
            compensations: vec![],
            replay_from: StepId::new("s2"),
            resume_checkpoint: None,
            status: TicketStatus::Open,
            reason: "dedupe failed".into(),
            created_at: Utc::now(),
        };
        assert!(ticket.is_open());
        assert!(ticket.covers(&artifact));
        ticket.status = TicketStatus::Resolved;
        assert!(!ticket.is_open());
    }
}
