//! Retroplan Core - planning and adaptive execution engine
//!
//! Turns a [`TaskBrief`](retroplan_model::TaskBrief) into a versioned plan
//! and runs it:
//! - Plans in two phases (brainstorm, then generate) and refuses plans that
//!   reference unregistered capabilities
//! - Executes ready steps concurrently under typed action contracts
//! - Decides continue / retry / alternate / replan / escalate after every
//!   observation
//! - Validates committed work asynchronously and, on failure, invalidates
//!   exactly the affected lineage, compensates and replays from the
//!   earliest valid checkpoint
//!
//! # Example
//!
//! ```rust,ignore
//! use retroplan_core::{demo, Coordinator, StaticProposer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let doc = demo::example_document();
//! let mut coordinator = Coordinator::builder(
//!     demo::echo_registry(&doc),
//!     StaticProposer::new(doc.candidates.clone()),
//! )
//! .build()?;
//!
//! let report = coordinator.run(doc.brief).await?;
//! println!("{} after {} decisions", report.status, report.decisions.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod binding;
pub mod capability;
pub mod checkpoint;
pub mod controller;
pub mod coordinator;
pub mod demo;
pub mod document;
pub mod error;
pub mod escalation;
pub mod events;
pub mod executor;
pub mod patcher;
pub mod planner;
pub mod replay;
pub mod retrospect;
pub mod telemetry;
pub mod validator;
pub mod verify;

pub use capability::{
    Agent, AgentResponse, Capability, CapabilityFailure, CapabilityRegistry, CapabilityRegistryBuilder,
    CapabilityResponse, ExecutionContext, Tool,
};
pub use checkpoint::CheckpointStore;
pub use controller::Controller;
pub use coordinator::{Coordinator, CoordinatorBuilder, RunReport};
pub use document::{CandidateCheck, DocumentError, PlanDocument};
pub use error::{
    AuditError, BindingError, CapabilityMissingError, EngineError, ExecutorError, PatchError,
    PlannerError,
};
pub use escalation::{
    Ack, EscalationAction, EscalationOutcome, EscalationPayload, EscalationRouter, LogNotifier,
    Notifier, NotifyError,
};
pub use events::{AuditLog, AuditRecord, EventBus, EventSink, RunEvent, TracingSink};
pub use executor::Executor;
pub use patcher::PlanPatcher;
pub use planner::{PlanOutcome, PlanProposer, Planner, ReplanRequest, StaticProposer};
pub use replay::ReplayManager;
pub use retrospect::{CustomCheck, RetroContext, RetroSnapshot, RetrospectRunner};
pub use validator::ContractValidator;
pub use verify::Verifier;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the engine
    pub use crate::{
        CapabilityRegistry, Coordinator, EngineError, Notifier, PlanProposer, RunReport,
        StaticProposer, Tool,
    };
    pub use retroplan_model::{
        ActionContract, Assertion, Binding, Candidate, Check, PolicyConfig, RunStatus, TaskBrief,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use retroplan_model::RunStatus;

    #[tokio::test]
    async fn example_document_runs_to_done() {
        let doc = demo::example_document();
        let mut coordinator = Coordinator::builder(
            demo::echo_registry(&doc),
            StaticProposer::new(doc.candidates.clone()),
        )
        .build()
        .unwrap();

        let report = coordinator.run(doc.brief).await.unwrap();
        assert_eq!(report.status, RunStatus::Done);
        let outputs = report.outputs.unwrap();
        assert_eq!(
            outputs["summary"],
            serde_json::json!("Summary of content-addressed storage")
        );
        assert!(coordinator.audit().verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let doc = demo::example_document();
        let mut coordinator = Coordinator::builder(
            demo::echo_registry(&doc),
            StaticProposer::new(doc.candidates.clone()),
        )
        .build()
        .unwrap();
        coordinator.run(doc.brief.clone()).await.unwrap();
        assert!(matches!(
            coordinator.run(doc.brief).await,
            Err(EngineError::InvalidState { .. })
        ));
    }
}
