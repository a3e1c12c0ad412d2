//! Escalation routing
//!
//! Maps a trigger to a severity through the policy, delivers the payload to
//! every channel subscribed at or below that severity, and tells the
//! coordinator whether to log, pause or halt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use retroplan_model::{EscalationTrigger, PolicyConfig, RunId, Severity, StepId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What a notification channel receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub trigger: EscalationTrigger,
    pub severity: Severity,
    pub message: String,
    pub plan_version: u64,
}

/// Delivery receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub channel: String,
    pub delivered_at: DateTime<Utc>,
}

impl Ack {
    #[must_use]
    pub fn now(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            delivered_at: Utc::now(),
        }
    }
}

/// Delivery failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("channel `{channel}` rejected delivery: {reason}")]
    Rejected { channel: String, reason: String },

    #[error("channel `{0}` timed out")]
    Timeout(String),
}

/// External notification backend (chat, paging, email)
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name used in acks and logs
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        severity: Severity,
        payload: &EscalationPayload,
    ) -> Result<Ack, NotifyError>;
}

/// Notifier that writes escalations to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(
        &self,
        severity: Severity,
        payload: &EscalationPayload,
    ) -> Result<Ack, NotifyError> {
        match severity {
            Severity::S1 | Severity::S2 => info!(
                run_id = %payload.run_id,
                trigger = %payload.trigger,
                severity = %severity,
                "{}", payload.message
            ),
            Severity::S3 => warn!(
                run_id = %payload.run_id,
                trigger = %payload.trigger,
                severity = %severity,
                "{}", payload.message
            ),
            Severity::S4 => error!(
                run_id = %payload.run_id,
                trigger = %payload.trigger,
                severity = %severity,
                "{}", payload.message
            ),
        }
        Ok(Ack::now(self.name()))
    }
}

/// What the coordinator must do after routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Keep going
    Log,
    /// Stop at a resumable point
    Pause,
    /// Stop until an operator acknowledges
    Halt,
}

/// Result of routing one escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub payload: EscalationPayload,
    pub action: EscalationAction,
    pub acks: Vec<Ack>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl EscalationOutcome {
    #[must_use]
    pub fn delivered(&self) -> bool {
        !self.acks.is_empty()
    }
}

struct Channel {
    min_severity: Severity,
    notifier: Arc<dyn Notifier>,
}

/// Classifies escalations and fans them out to channels
pub struct EscalationRouter {
    policy: Arc<PolicyConfig>,
    channels: Vec<Channel>,
}

impl std::fmt::Debug for EscalationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationRouter")
            .field(
                "channels",
                &self
                    .channels
                    .iter()
                    .map(|c| (c.notifier.name().to_string(), c.min_severity))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl EscalationRouter {
    #[must_use]
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self {
            policy,
            channels: Vec::new(),
        }
    }

    /// Subscribe a channel to escalations at or above `min_severity`
    #[must_use]
    pub fn with_channel(mut self, min_severity: Severity, notifier: Arc<dyn Notifier>) -> Self {
        self.channels.push(Channel {
            min_severity,
            notifier,
        });
        self
    }

    /// Severity the policy assigns to a trigger
    #[must_use]
    pub fn classify(&self, trigger: EscalationTrigger) -> Severity {
        self.policy.severity_for(trigger)
    }

    /// Coordinator action for a severity
    #[must_use]
    pub fn action_for(&self, severity: Severity) -> EscalationAction {
        if self.policy.halts(severity) {
            EscalationAction::Halt
        } else if self.policy.pauses(severity) {
            EscalationAction::Pause
        } else {
            EscalationAction::Log
        }
    }

    /// Deliver to every subscribed channel concurrently
    ///
    /// Delivery failures and timeouts are collected, never raised.
    pub async fn route(&self, payload: EscalationPayload) -> EscalationOutcome {
        let severity = payload.severity;
        let deadline = Duration::from_millis(self.policy.timeouts.escalation_ms);
        let deliveries = self
            .channels
            .iter()
            .filter(|c| severity >= c.min_severity)
            .map(|c| {
                let payload = &payload;
                async move {
                    let name = c.notifier.name().to_string();
                    match tokio::time::timeout(deadline, c.notifier.deliver(severity, payload)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(NotifyError::Timeout(name)),
                    }
                }
            });
        let results = join_all(deliveries).await;

        let mut acks = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(ack) => acks.push(ack),
                Err(e) => {
                    warn!(error = %e, "escalation delivery failed");
                    failures.push(e.to_string());
                }
            }
        }

        let action = self.action_for(severity);
        info!(
            run_id = %payload.run_id,
            trigger = %payload.trigger,
            severity = %severity,
            action = ?action,
            delivered = acks.len(),
            "escalation routed"
        );
        metrics::counter!("retroplan_escalations_total", "severity" => severity.to_string())
            .increment(1);

        EscalationOutcome {
            payload,
            action,
            acks,
            failures,
        }
    }
}
