use proptest::prelude::*;
use retroplan_lineage::LineageGraph;
use retroplan_model::{CapabilityId, Checkpoint, ContentHash, Provenance, StepId, TicketId};
use std::collections::BTreeSet;
use std::sync::Arc;

fn hash(n: usize) -> ContentHash {
    ContentHash::compute(&n.to_le_bytes())
}

fn prov(n: usize, inputs: &BTreeSet<usize>) -> Provenance {
    let artifact = hash(n);
    let step_id = StepId::new(format!("s{n}"));
    Provenance {
        artifact,
        checkpoint: Checkpoint::address(&step_id, &artifact),
        step_id,
        inputs: inputs.iter().map(|i| hash(*i)).collect(),
        capability: CapabilityId::new("tool"),
        capability_version: String::new(),
    }
}

/// Node `i` may only depend on nodes `< i`, so every graph is a DAG
fn dag() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..24usize).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(BTreeSet::new()).boxed()
                } else {
                    proptest::collection::btree_set(0..i, 0..3.min(i + 1)).boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

fn reaches(edges: &[BTreeSet<usize>], from: usize, to: usize) -> bool {
    if from == to {
        return true;
    }
    edges[to].iter().any(|parent| reaches(edges, from, *parent))
}

proptest! {
    #[test]
    fn prop_invalidation_is_exactly_downstream(
        edges in dag(),
        pick in any::<prop::sample::Index>()
    ) {
        let graph = LineageGraph::new();
        for (i, inputs) in edges.iter().enumerate() {
            graph.record(prov(i, inputs)).unwrap();
        }
        let target = pick.index(edges.len());
        let downstream = graph.downstream_of(&hash(target));

        let ticket = TicketId::new();
        graph.invalidate(ticket, &downstream);

        for i in 0..edges.len() {
            let dependent = reaches(&edges, target, i);
            prop_assert_eq!(downstream.contains(&hash(i)), dependent);
            prop_assert_eq!(graph.is_valid(&hash(i)), !dependent);
        }

        if let Some(ancestor) = graph.find_earliest_valid_ancestor(&hash(target)) {
            prop_assert!(graph.is_valid(&ancestor.artifact));
            prop_assert!(graph.upstream_of(&hash(target)).contains(&ancestor.artifact));
        } else {
            prop_assert!(graph.upstream_of(&hash(target)).iter().all(|h| !graph.is_valid(h)));
        }

        graph.close_ticket(ticket);
        prop_assert!((0..edges.len()).all(|i| graph.is_valid(&hash(i))));
    }
}

#[test]
fn concurrent_records_are_visible_to_later_reads() {
    let graph = Arc::new(LineageGraph::new());
    graph.record(prov(0, &BTreeSet::new())).unwrap();

    let writers: Vec<_> = (1..=8)
        .map(|branch| {
            let graph = Arc::clone(&graph);
            std::thread::spawn(move || {
                let mut parent = 0;
                for depth in 0..25 {
                    let id = branch * 1000 + depth;
                    graph.record(prov(id, &BTreeSet::from([parent]))).unwrap();
                    // concurrent reads never see a partial branch below the root
                    let seen = graph.downstream_of(&hash(0));
                    assert!(seen.contains(&hash(id)));
                    parent = id;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(graph.downstream_of(&hash(0)).len(), 1 + 8 * 25);
    assert_eq!(graph.downstream_of(&hash(3000)).len(), 25);
}

#[test]
fn racing_conflicting_records_keep_the_first_provenance() {
    for _ in 0..200 {
        let graph = Arc::new(LineageGraph::new());
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let racers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|capability| {
                let graph = Arc::clone(&graph);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut provenance = prov(7, &BTreeSet::new());
                    provenance.capability = CapabilityId::new(capability);
                    barrier.wait();
                    graph.record(provenance.clone()).map(|()| provenance)
                })
            })
            .collect();
        let results: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();

        let accepted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(graph.get(&hash(7)).as_ref(), Some(accepted[0]));
    }
}

#[test]
fn identical_record_is_idempotent_and_conflicting_one_is_rejected() {
    let graph = LineageGraph::new();
    let original = prov(1, &BTreeSet::new());
    graph.record(original.clone()).unwrap();
    graph.record(original.clone()).unwrap();

    let mut other = original.clone();
    other.capability_version = "v2".into();
    assert!(matches!(
        graph.record(other),
        Err(retroplan_lineage::LineageError::Conflict(h)) if h == hash(1)
    ));
    assert_eq!(graph.get(&hash(1)), Some(original));
}
