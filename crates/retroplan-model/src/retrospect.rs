//! Retrospect jobs: deferred validation of a checkpointed artifact

use crate::contract::{OnFailPolicy, RetroCheck, RetrospectSpec};
use crate::hash::ContentHash;
use crate::ids::{CheckpointId, JobId, StepId};
use crate::observation::CheckResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a retrospect job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Ok,
    Fail,
    Timeout,
    /// Withdrawn because its artifact was invalidated
    Cancelled,
}

impl JobStatus {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Fail | Self::Timeout | Self::Cancelled)
    }

    /// Terminal and not `ok`; triggers `on_fail`
    #[inline]
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Timeout)
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::{Cancelled, Fail, Ok, Pending, Running, Timeout};
        matches!(
            (self, to),
            (Pending, Running | Cancelled) | (Running, Ok | Fail | Timeout | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A scheduled retrospect against one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectJob {
    pub id: JobId,
    pub name: String,
    pub step_id: StepId,
    pub target: CheckpointId,
    pub artifact: ContentHash,
    pub checks: Vec<RetroCheck>,
    pub on_fail: OnFailPolicy,
    pub timeout_ms: u64,
    pub status: JobStatus,
    /// Failed check results, filled on `fail`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<CheckResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RetrospectJob {
    /// Pending job for `spec` on a step's checkpoint
    ///
    /// `default_timeout_ms` applies when the spec declares none.
    #[must_use]
    pub fn from_spec(
        spec: &RetrospectSpec,
        step_id: StepId,
        target: CheckpointId,
        artifact: ContentHash,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            id: JobId::new(),
            name: spec.name.clone(),
            step_id,
            target,
            artifact,
            checks: spec.checks.clone(),
            on_fail: spec.on_fail.clone(),
            timeout_ms: spec.timeout_ms.unwrap_or(default_timeout_ms),
            status: JobStatus::Pending,
            failures: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `to`, stamping `finished_at` on terminal states
    ///
    /// Returns `false` and leaves the job unchanged when illegal.
    pub fn transition(&mut self, to: JobStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> RetrospectJob {
        let spec = RetrospectSpec::new("dedupe", vec![]);
        RetrospectJob::from_spec(
            &spec,
            StepId::new("s"),
            CheckpointId(ContentHash::compute(b"c")),
            ContentHash::compute(b"a"),
            500,
        )
    }

    #[test]
    fn lifecycle_is_pending_running_terminal() {
        let mut job = job();
        assert_eq!(job.timeout_ms, 500);
        assert!(!job.transition(JobStatus::Ok));
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Timeout));
        assert!(job.finished_at.is_some());
        assert!(job.status.is_failure());
        assert!(!job.transition(JobStatus::Running));
    }

    #[test]
    fn pending_jobs_can_be_cancelled() {
        let mut job = job();
        assert!(job.transition(JobStatus::Cancelled));
        assert!(job.status.is_terminal());
        assert!(!job.status.is_failure());
    }
}
