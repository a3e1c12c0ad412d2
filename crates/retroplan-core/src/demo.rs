//! Dry-run helpers for the CLI
//!
//! [`EchoTool`] stands in for every capability a document names, so a plan
//! can be exercised end to end without real tools.

use crate::capability::{
    CapabilityFailure, CapabilityRegistry, CapabilityResponse, ExecutionContext, Tool,
};
use crate::document::PlanDocument;
use async_trait::async_trait;
use retroplan_model::{
    ActionContract, Assertion, Binding, Candidate, Check, RetroCheck, RetrospectSpec, TaskBrief,
    UndoAction, ValueType,
};
use serde_json::json;
use std::collections::BTreeMap;

/// Returns its inputs as outputs
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn version(&self) -> &str {
        "echo-1"
    }

    async fn invoke(
        &self,
        inputs: &retroplan_model::Outputs,
        _ctx: &ExecutionContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        Ok(CapabilityResponse::new(inputs.clone()).with_cost(0.01))
    }
}

/// Registry binding every capability of `doc` to [`EchoTool`]
#[must_use]
pub fn echo_registry(doc: &PlanDocument) -> CapabilityRegistry {
    doc.capabilities()
        .into_iter()
        .fold(CapabilityRegistry::builder(), |builder, id| {
            builder.tool(id, EchoTool)
        })
        .build()
}

/// A small two-candidate document, printed by `retroplan schema-example`
#[must_use]
pub fn example_document() -> PlanDocument {
    let brief = TaskBrief::new("Summarize what is known about a topic")
        .with_input("topic", json!("content-addressed storage"))
        .with_required_output("summary", ValueType::String)
        .with_acceptance_test(Check::new(
            "summary present",
            Assertion::NonEmpty {
                key: "summary".into(),
            },
        ));

    let fetch = ActionContract::new("fetch", "Collect sources for the topic", "search")
        .bind("query", Binding::input("topic"))
        .produces(["query"])
        .with_alternate(
            ActionContract::new("fetch", "Fall back to the local index", "local_index")
                .bind("query", Binding::input("topic"))
                .produces(["query"]),
        );

    let mut required = BTreeMap::new();
    required.insert("summary".to_string(), ValueType::String);
    let summarize = ActionContract::new("summarize", "Write the summary", "writer")
        .bind("summary", Binding::template("Summary of {{ fetch.query }}"))
        .produces(["summary"])
        .ensures(Assertion::NonEmpty {
            key: "summary".into(),
        })
        .with_retrospect(RetrospectSpec::new(
            "summary shape",
            vec![RetroCheck::Schema { required }],
        ))
        .requiring_retro_green()
        .compensated_by(
            UndoAction::new("writer").bind("discard", Binding::output("summarize", "summary")),
        );

    let primary = Candidate::new("search then summarize", 0.8)
        .step(fetch, &[])
        .step(summarize, &["fetch"]);

    let direct = Candidate::new("summarize from memory", 0.4).step(
        ActionContract::new("summarize", "Write the summary directly", "writer")
            .bind("summary", Binding::template("Notes on {{ input.topic }}"))
            .produces(["summary"]),
        &[],
    );

    PlanDocument {
        brief,
        candidates: vec![primary, direct],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroplan_model::StepId;

    #[tokio::test]
    async fn echo_returns_inputs() {
        let mut inputs = retroplan_model::Outputs::new();
        inputs.insert("q".into(), json!("x"));
        let ctx = ExecutionContext::new(StepId::new("s"), 1_000);
        let response = EchoTool.invoke(&inputs, &ctx).await.unwrap();
        assert_eq!(response.outputs, inputs);
    }

    #[test]
    fn registry_covers_every_document_capability() {
        let doc = example_document();
        let registry = echo_registry(&doc);
        for id in doc.capabilities() {
            assert!(registry.contains(&id), "{id} not registered");
        }
        assert_eq!(registry.len(), 3);
    }
}
