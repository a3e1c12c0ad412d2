//! Structured run events and their sinks
//!
//! Every decision, patch, retrospect transition, ticket and escalation is
//! emitted as a [`RunEvent`]. The [`AuditLog`] keeps them in a sha256 hash
//! chain so the trail of a run can be replayed and checked for tampering.

use crate::error::AuditError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use retroplan_model::{
    CheckpointId, CompensationRecord, ContentHash, Decision, EscalationTrigger,
    InvalidationTicket, JobId, JobStatus, PlanId, PlanPatch, RunId, RunStatus, Severity, StepId,
    TicketId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One auditable occurrence during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    StatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    PlanCreated {
        run_id: RunId,
        plan_id: PlanId,
        version: u64,
        steps: usize,
        candidate: String,
    },
    PlanPatched {
        run_id: RunId,
        patch: PlanPatch,
    },
    DecisionMade {
        run_id: RunId,
        decision: Decision,
    },
    StepExecuted {
        run_id: RunId,
        step_id: StepId,
        attempt: u32,
        success: bool,
        cost: f64,
        duration_ms: u64,
    },
    CheckpointCommitted {
        run_id: RunId,
        checkpoint: CheckpointId,
        step_id: StepId,
        artifact: ContentHash,
        plan_version: u64,
    },
    RetrospectTransition {
        run_id: RunId,
        job_id: JobId,
        step_id: StepId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<JobStatus>,
        to: JobStatus,
    },
    TicketIssued {
        run_id: RunId,
        ticket: InvalidationTicket,
    },
    CompensationRan {
        run_id: RunId,
        record: CompensationRecord,
    },
    TicketResolved {
        run_id: RunId,
        ticket_id: TicketId,
    },
    EscalationRouted {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
        trigger: EscalationTrigger,
        severity: Severity,
        delivered: usize,
    },
    PromotionHeld {
        run_id: RunId,
        waiting_on: Vec<JobId>,
    },
    PromotionGranted {
        run_id: RunId,
        plan_version: u64,
    },
}

impl RunEvent {
    /// Event kind, used as a metric label
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::PlanCreated { .. } => "plan_created",
            Self::PlanPatched { .. } => "plan_patched",
            Self::DecisionMade { .. } => "decision_made",
            Self::StepExecuted { .. } => "step_executed",
            Self::CheckpointCommitted { .. } => "checkpoint_committed",
            Self::RetrospectTransition { .. } => "retrospect_transition",
            Self::TicketIssued { .. } => "ticket_issued",
            Self::CompensationRan { .. } => "compensation_ran",
            Self::TicketResolved { .. } => "ticket_resolved",
            Self::EscalationRouted { .. } => "escalation_routed",
            Self::PromotionHeld { .. } => "promotion_held",
            Self::PromotionGranted { .. } => "promotion_granted",
        }
    }
}

/// Receives run events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::StatusChanged { run_id, from, to } => {
                info!(run_id = %run_id, from = %from, to = %to, "run status changed");
            }
            RunEvent::DecisionMade { decision, .. } => {
                info!(
                    step_id = %decision.step_id,
                    attempt = decision.attempt,
                    verdict = decision.verdict.name(),
                    rationale = %decision.rationale,
                    "decision"
                );
            }
            RunEvent::TicketIssued { ticket, .. } => {
                warn!(
                    ticket_id = %ticket.id,
                    origin = %ticket.origin_step,
                    invalidated = ticket.invalidated.len(),
                    replay_from = %ticket.replay_from,
                    "invalidation ticket issued"
                );
            }
            RunEvent::CompensationRan { record, .. } if !record.success => {
                error!(
                    ticket_id = %record.ticket_id,
                    step_id = %record.step_id,
                    error = record.error.as_deref().unwrap_or(""),
                    "compensation failed"
                );
            }
            other => debug!(kind = other.kind(), event = ?other, "run event"),
        }
    }
}

/// One link of the audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: RunEvent,
    #[serde(with = "hex")]
    pub prev_hash: [u8; 32],
    #[serde(with = "hex")]
    pub hash: [u8; 32],
}

/// Append-only, hash-chained event log
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, linking it to the previous record
    ///
    /// # Errors
    /// Returns [`AuditError::Encoding`] if the event cannot be serialized
    pub fn append(&self, event: RunEvent) -> Result<u64, AuditError> {
        let mut guard = self.inner.lock();
        let seq = guard.len() as u64;
        let prev_hash = guard.last().map_or([0u8; 32], |r| r.hash);
        let mut record = AuditRecord {
            seq,
            timestamp: Utc::now(),
            event,
            prev_hash,
            hash: [0u8; 32],
        };
        record.hash = compute_hash(&record)?;
        guard.push(record);
        Ok(seq)
    }

    /// Snapshot of every record
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().clone()
    }

    /// Events in emission order
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.inner.lock().iter().map(|r| r.event.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Recompute every hash and back-link
    ///
    /// # Errors
    /// Returns [`AuditError::IntegrityViolation`] with the first bad record
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let guard = self.inner.lock();
        let mut prev = [0u8; 32];
        for (i, record) in guard.iter().enumerate() {
            if record.seq != i as u64 || record.prev_hash != prev {
                return Err(AuditError::IntegrityViolation(i as u64));
            }
            if record.hash != compute_hash(record)? {
                return Err(AuditError::IntegrityViolation(record.seq));
            }
            prev = record.hash;
        }
        Ok(())
    }
}

impl EventSink for AuditLog {
    fn emit(&self, event: &RunEvent) {
        if let Err(e) = self.append(event.clone()) {
            error!(error = %e, kind = event.kind(), "failed to append audit record");
        }
    }
}

fn compute_hash(record: &AuditRecord) -> Result<[u8; 32], AuditError> {
    let body = serde_json::to_vec(&record.event).map_err(|e| AuditError::Encoding(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(record.seq.to_le_bytes());
    hasher.update(record.timestamp.timestamp_micros().to_le_bytes());
    hasher.update(&body);
    hasher.update([0]);
    hasher.update(record.prev_hash);
    Ok(hasher.finalize().into())
}

/// Fans each event out to several sinks and counts it
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &RunEvent) {
        metrics::counter!("retroplan_events_total", "kind" => event.kind()).increment(1);
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(run_id: RunId, from: RunStatus, to: RunStatus) -> RunEvent {
        RunEvent::StatusChanged { run_id, from, to }
    }

    #[test]
    fn chain_detects_tampering() {
        let log = AuditLog::new();
        let run = RunId::new();
        log.append(status(run, RunStatus::Planning, RunStatus::Running)).unwrap();
        log.append(status(run, RunStatus::Running, RunStatus::Done)).unwrap();
        log.verify_integrity().unwrap();

        log.inner.lock()[0].event = status(run, RunStatus::Planning, RunStatus::Failed);
        assert_eq!(log.verify_integrity(), Err(AuditError::IntegrityViolation(0)));
    }

    #[test]
    fn removing_a_record_breaks_the_links() {
        let log = AuditLog::new();
        let run = RunId::new();
        for _ in 0..3 {
            log.append(status(run, RunStatus::Running, RunStatus::Paused)).unwrap();
        }
        log.inner.lock().remove(1);
        assert!(log.verify_integrity().is_err());
    }

    #[test]
    fn bus_fans_out_to_every_sink() {
        let a = Arc::new(AuditLog::new());
        let b = Arc::new(AuditLog::new());
        let bus = EventBus::new().with_sink(a.clone()).with_sink(b.clone());
        bus.emit(&RunEvent::PromotionGranted {
            run_id: RunId::new(),
            plan_version: 2,
        });
        assert_eq!(a.len(), 1);
        assert_eq!(b.events(), a.events());
    }

    #[test]
    fn events_are_tagged_by_kind() {
        let event = RunEvent::TicketResolved {
            run_id: RunId::new(),
            ticket_id: TicketId::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.kind());
    }
}
