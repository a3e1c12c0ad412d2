//! Capability registry
//!
//! Capabilities are the external agents and tools plan steps invoke. The
//! registry is built once, then shared immutably; lookups return a tagged
//! [`Capability`] so callers match on the declared kind.

use async_trait::async_trait;
use retroplan_model::{
    Budget, CapabilityCheck, CapabilityId, CapabilityKind, CapabilityVerification, Candidate,
    Outputs, StepId, TraceId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a capability
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub trace_id: TraceId,
    pub step_id: StepId,
    pub attempt: u32,
    /// Budget left for the whole run
    pub budget_remaining: Budget,
    pub deadline_ms: u64,
    /// Fires when the invocation's result is no longer wanted
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// Context for a first attempt with no budget limits
    #[must_use]
    pub fn new(step_id: StepId, deadline_ms: u64) -> Self {
        Self {
            trace_id: TraceId::new(),
            step_id,
            attempt: 1,
            budget_remaining: Budget::default(),
            deadline_ms,
            cancel: CancellationToken::new(),
        }
    }
}

/// Successful capability response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityResponse {
    pub outputs: Outputs,
    pub cost: f64,
    /// Reported duration; the executor measures wall time when absent
    pub duration_ms: Option<u64>,
    pub raw: Value,
}

impl CapabilityResponse {
    /// Response carrying only outputs
    #[must_use]
    pub fn new(outputs: Outputs) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    /// With the incurred cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// With a reported duration
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// With raw response metadata
    #[must_use]
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Agent response: a capability response plus self-reported confidence
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub response: CapabilityResponse,
    pub confidence: f64,
}

/// An ordinary capability failure
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityFailure {
    pub message: String,
    pub retryable: bool,
    /// Cost incurred before failing
    pub cost: f64,
}

impl CapabilityFailure {
    /// Retryable failure
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            cost: 0.0,
        }
    }

    /// Failure a retry cannot fix
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }
}

/// A deterministic external tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Version recorded in provenance
    fn version(&self) -> &str {
        ""
    }

    /// Invoke with resolved inputs
    async fn invoke(
        &self,
        inputs: &Outputs,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityResponse, CapabilityFailure>;
}

/// A reasoning agent that reports confidence
#[async_trait]
pub trait Agent: Send + Sync {
    /// Version recorded in provenance
    fn version(&self) -> &str {
        ""
    }

    /// Run with resolved inputs
    async fn run(
        &self,
        inputs: &Outputs,
        ctx: &ExecutionContext,
    ) -> Result<AgentResponse, CapabilityFailure>;
}

/// A registered capability
#[derive(Clone)]
pub enum Capability {
    Tool(Arc<dyn Tool>),
    Agent(Arc<dyn Agent>),
}

impl Capability {
    /// Declared kind
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Tool(_) => CapabilityKind::Tool,
            Self::Agent(_) => CapabilityKind::Agent,
        }
    }

    /// Version recorded in provenance
    #[must_use]
    pub fn version(&self) -> &str {
        match self {
            Self::Tool(tool) => tool.version(),
            Self::Agent(agent) => agent.version(),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("kind", &self.kind())
            .field("version", &self.version())
            .finish()
    }
}

/// Immutable capability lookup table
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<CapabilityId, Capability>,
}

impl CapabilityRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    /// Look up a capability
    #[must_use]
    pub fn resolve(&self, id: &CapabilityId) -> Option<&Capability> {
        self.entries.get(id)
    }

    /// Whether `id` is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.entries.contains_key(id)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every capability a candidate references
    #[must_use]
    pub fn verify(&self, candidate: &Candidate) -> CapabilityVerification {
        let checks = candidate
            .capabilities()
            .into_iter()
            .map(|capability| {
                let kind = self.resolve(&capability).map(Capability::kind);
                CapabilityCheck {
                    available: kind.is_some(),
                    capability,
                    kind,
                }
            })
            .collect();
        CapabilityVerification {
            candidate: candidate.name.clone(),
            checks,
        }
    }
}

/// Builder for [`CapabilityRegistry`]
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    entries: HashMap<CapabilityId, Capability>,
}

impl CapabilityRegistryBuilder {
    /// Register a tool
    #[must_use]
    pub fn tool(mut self, id: impl Into<CapabilityId>, tool: impl Tool + 'static) -> Self {
        self.entries
            .insert(id.into(), Capability::Tool(Arc::new(tool)));
        self
    }

    /// Register an agent
    #[must_use]
    pub fn agent(mut self, id: impl Into<CapabilityId>, agent: impl Agent + 'static) -> Self {
        self.entries
            .insert(id.into(), Capability::Agent(Arc::new(agent)));
        self
    }

    /// Register an already-wrapped capability
    #[must_use]
    pub fn capability(mut self, id: impl Into<CapabilityId>, capability: Capability) -> Self {
        self.entries.insert(id.into(), capability);
        self
    }

    #[must_use]
    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroplan_model::ActionContract;

    struct Noop;

    #[async_trait]
    impl Tool for Noop {
        fn version(&self) -> &str {
            "1.0"
        }

        async fn invoke(
            &self,
            _inputs: &Outputs,
            _ctx: &ExecutionContext,
        ) -> Result<CapabilityResponse, CapabilityFailure> {
            Ok(CapabilityResponse::default())
        }
    }

    #[test]
    fn resolves_by_kind() {
        let registry = CapabilityRegistry::builder().tool("noop", Noop).build();
        let cap = registry.resolve(&"noop".into()).unwrap();
        assert_eq!(cap.kind(), CapabilityKind::Tool);
        assert_eq!(cap.version(), "1.0");
        assert!(registry.resolve(&"other".into()).is_none());
    }

    #[test]
    fn verify_reports_missing_including_alternates() {
        let registry = CapabilityRegistry::builder().tool("noop", Noop).build();
        let candidate = Candidate::new("c", 0.9).step(
            ActionContract::new("s", "x", "noop")
                .with_alternate(ActionContract::new("s-alt", "y", "search")),
            &[],
        );
        let verification = registry.verify(&candidate);
        assert!(!verification.is_complete());
        assert_eq!(verification.missing(), vec![CapabilityId::new("search")]);
    }
}
