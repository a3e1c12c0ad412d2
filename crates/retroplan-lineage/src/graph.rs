//! Lineage graph over content-addressed artifacts
//!
//! Nodes are [`Provenance`] records keyed by artifact hash. Edges run from
//! an input artifact to every artifact derived from it. All maps are
//! sharded [`DashMap`]s so concurrent writers and readers only contend on
//! the shard holding the artifact they touch.
//!
//! `record` links the forward edges before the node is published. A reader
//! that reaches the new artifact through an edge may find it has no node
//! yet; traversal still yields its hash, so `downstream_of` never misses a
//! dependent whose edge from the traversed branch is already linked.

use crate::error::LineageError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use retroplan_model::{CheckpointId, ContentHash, Provenance, StepId, TicketId};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Content-addressed provenance graph
#[derive(Debug, Default)]
pub struct LineageGraph {
    /// artifact -> provenance
    nodes: DashMap<ContentHash, Provenance>,

    /// input artifact -> artifacts derived from it
    children: DashMap<ContentHash, BTreeSet<ContentHash>>,

    /// step -> most recently recorded artifact
    latest: DashMap<StepId, ContentHash>,

    /// artifact -> open ticket covering it
    invalidated: DashMap<ContentHash, TicketId>,
}

impl LineageGraph {
    /// Create empty graph
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one provenance entry
    ///
    /// Recording an identical entry again is a no-op, which is what a
    /// replay with unchanged inputs produces.
    ///
    /// # Errors
    /// Returns error if an input is unknown, the artifact references
    /// itself, or the hash is already recorded with different provenance
    pub fn record(&self, provenance: Provenance) -> Result<(), LineageError> {
        let artifact = provenance.artifact;
        for input in &provenance.inputs {
            if *input == artifact {
                return Err(LineageError::SelfReference(artifact));
            }
            if !self.nodes.contains_key(input) {
                return Err(LineageError::UnknownInput {
                    artifact,
                    step: provenance.step_id.clone(),
                    input: *input,
                });
            }
        }

        // the shard stays locked until the node is published
        match self.nodes.entry(artifact) {
            Entry::Occupied(existing) => {
                if *existing.get() != provenance {
                    return Err(LineageError::Conflict(artifact));
                }
                drop(existing);
                self.latest.insert(provenance.step_id, artifact);
            }
            Entry::Vacant(slot) => {
                for input in &provenance.inputs {
                    self.children.entry(*input).or_default().insert(artifact);
                }
                debug!(
                    artifact = %artifact.short(),
                    step_id = %provenance.step_id,
                    inputs = provenance.inputs.len(),
                    "lineage recorded"
                );
                self.latest.insert(provenance.step_id.clone(), artifact);
                slot.insert(provenance);
            }
        }
        Ok(())
    }

    /// Provenance of an artifact
    #[must_use]
    pub fn get(&self, artifact: &ContentHash) -> Option<Provenance> {
        self.nodes.get(artifact).map(|p| p.clone())
    }

    /// Whether an artifact has been recorded
    #[inline]
    #[must_use]
    pub fn contains(&self, artifact: &ContentHash) -> bool {
        self.nodes.contains_key(artifact)
    }

    /// Most recent artifact recorded for a step
    #[must_use]
    pub fn latest_for(&self, step: &StepId) -> Option<ContentHash> {
        self.latest.get(step).map(|h| *h)
    }

    /// Number of recorded artifacts
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing has been recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every artifact transitively derived from `artifact`, including itself
    #[must_use]
    pub fn downstream_of(&self, artifact: &ContentHash) -> BTreeSet<ContentHash> {
        let mut seen = BTreeSet::from([*artifact]);
        let mut queue = VecDeque::from([*artifact]);
        while let Some(current) = queue.pop_front() {
            let Some(children) = self.children.get(&current).map(|c| c.clone()) else {
                continue;
            };
            for child in children {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }

    /// Every artifact `artifact` was transitively derived from, excluding itself
    #[must_use]
    pub fn upstream_of(&self, artifact: &ContentHash) -> BTreeSet<ContentHash> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<ContentHash> = self.inputs_of(artifact).into();
        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                queue.extend(self.inputs_of(&current));
            }
        }
        seen
    }

    fn inputs_of(&self, artifact: &ContentHash) -> Vec<ContentHash> {
        self.nodes
            .get(artifact)
            .map(|p| p.inputs.clone())
            .unwrap_or_default()
    }

    /// Nearest upstream artifact not covered by an open ticket
    ///
    /// Searches breadth-first from the artifact's inputs; among ancestors at
    /// the same distance the smallest hash wins so the answer is stable.
    /// `None` means no valid ancestor exists and a replay starts from scratch.
    #[must_use]
    pub fn find_earliest_valid_ancestor(&self, artifact: &ContentHash) -> Option<Provenance> {
        let mut seen = BTreeSet::new();
        let mut level: BTreeSet<ContentHash> = self.inputs_of(artifact).into_iter().collect();
        while !level.is_empty() {
            if let Some(valid) = level.iter().find(|h| self.is_valid(h)) {
                return self.get(valid);
            }
            seen.extend(level.iter().copied());
            level = level
                .iter()
                .flat_map(|h| self.inputs_of(h))
                .filter(|h| !seen.contains(h))
                .collect();
        }
        None
    }

    /// Whether no open ticket covers the artifact
    #[inline]
    #[must_use]
    pub fn is_valid(&self, artifact: &ContentHash) -> bool {
        !self.invalidated.contains_key(artifact)
    }

    /// Ticket currently covering an artifact
    #[must_use]
    pub fn covering_ticket(&self, artifact: &ContentHash) -> Option<TicketId> {
        self.invalidated.get(artifact).map(|t| *t)
    }

    /// Mark artifacts as covered by `ticket`
    ///
    /// Artifacts already covered by another open ticket keep that ticket.
    pub fn invalidate<'a>(
        &self,
        ticket: TicketId,
        artifacts: impl IntoIterator<Item = &'a ContentHash>,
    ) -> usize {
        let mut marked = 0;
        for artifact in artifacts {
            self.invalidated.entry(*artifact).or_insert_with(|| {
                marked += 1;
                ticket
            });
        }
        debug!(ticket_id = %ticket, marked, "artifacts invalidated");
        marked
    }

    /// Release every artifact covered by `ticket`
    pub fn close_ticket(&self, ticket: TicketId) -> usize {
        let before = self.invalidated.len();
        self.invalidated.retain(|_, t| *t != ticket);
        before.saturating_sub(self.invalidated.len())
    }

    /// Steps that produced any of `artifacts`
    #[must_use]
    pub fn steps_of<'a>(
        &self,
        artifacts: impl IntoIterator<Item = &'a ContentHash>,
    ) -> BTreeSet<StepId> {
        artifacts
            .into_iter()
            .filter_map(|h| self.nodes.get(h).map(|p| p.step_id.clone()))
            .collect()
    }

    /// Checkpoints holding any of `artifacts`
    #[must_use]
    pub fn checkpoints_of<'a>(
        &self,
        artifacts: impl IntoIterator<Item = &'a ContentHash>,
    ) -> BTreeSet<CheckpointId> {
        artifacts
            .into_iter()
            .filter_map(|h| self.nodes.get(h).map(|p| p.checkpoint))
            .collect()
    }
}
