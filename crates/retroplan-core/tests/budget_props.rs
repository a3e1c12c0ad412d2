//! Budget enforcement properties

use proptest::prelude::*;
use retroplan_core::{CapabilityRegistry, Coordinator, StaticProposer};
use retroplan_model::{
    Budget, Candidate, EscalationTrigger, FailureKind, RunState, RunStatus, Verdict,
};
use retroplan_test_utils::{brief, chain_step, ScriptedTool};

fn run_chain(costs: &[f64], max_cost: f64) -> retroplan_core::RunReport {
    run_chain_with_state(costs, max_cost).0
}

fn run_chain_with_state(costs: &[f64], max_cost: f64) -> (retroplan_core::RunReport, RunState) {
    let mut registry = CapabilityRegistry::builder();
    let mut candidate = Candidate::new("chain", 0.9);
    let mut prev: Option<String> = None;
    for (i, cost) in costs.iter().enumerate() {
        let id = format!("s{i}");
        let capability = format!("tool{i}");
        registry = registry.tool(capability.as_str(), ScriptedTool::echo().with_cost(*cost));
        let deps: Vec<&str> = prev.as_deref().into_iter().collect();
        candidate = candidate.step(chain_step(&id, prev.as_deref(), &capability), &deps);
        prev = Some(id);
    }

    let brief = brief("budgeted").with_constraints(Budget {
        max_cost: Some(max_cost),
        ..Budget::default()
    });
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut coordinator =
            Coordinator::builder(registry.build(), StaticProposer::new(vec![candidate]))
                .build()
                .unwrap();
        let report = coordinator.run(brief).await.unwrap();
        (report, coordinator.state().clone())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn never_continues_past_the_budget(
        costs in prop::collection::vec(0.0f64..4.0, 1..5),
        max_cost in 0.0f64..10.0,
    ) {
        let report = run_chain(&costs, max_cost);
        let total = costs.iter().fold(0.0, |acc, c| acc + c);

        if total > max_cost {
            prop_assert_ne!(report.status, RunStatus::Done);
            let last = report.decisions.last().unwrap();
            let is_budget_escalation = matches!(
                last.verdict,
                Verdict::Escalate { trigger: EscalationTrigger::BudgetExceeded, .. }
            );
            prop_assert!(is_budget_escalation);
        } else {
            prop_assert_eq!(report.status, RunStatus::Done);
            prop_assert!(report.spend.cost <= max_cost);
        }

        // a step is only ever accepted while the run is within budget
        let mut spent = 0.0;
        for decision in &report.decisions {
            let index: usize = decision.step_id.as_str()[1..].parse().unwrap();
            spent += costs[index];
            if matches!(decision.verdict, Verdict::Continue) {
                prop_assert!(spent <= max_cost);
            }
        }
    }
}

#[test]
fn misreported_costs_never_slip_past_the_cap() {
    for costs in [[f64::NAN, 5.0, 5.0], [-100.0, 50.0, 50.0]] {
        let (report, state) = run_chain_with_state(&costs, 1.0);

        assert_ne!(report.status, RunStatus::Done, "{costs:?}");
        assert!(report.outputs.is_none());
        assert!(report.spend.cost.is_finite());
        assert!(report.spend.cost <= 1.0);
        // the first step is never accepted, so nothing after it runs
        assert!(report
            .decisions
            .iter()
            .all(|d| !matches!(d.verdict, Verdict::Continue)));
        assert!(state.completed.is_empty());
        assert!(state
            .history
            .iter()
            .all(|o| o.step_id.as_str() == "s0"
                && o.failure_kind() == Some(FailureKind::InvalidResponse)));
    }
}
