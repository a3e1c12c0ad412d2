//! Content-addressed checkpoint store
//!
//! Checkpoints are immutable. A step that re-commits gets a new checkpoint
//! that names the one it supersedes; nothing is edited or removed.

use dashmap::DashMap;
use retroplan_model::{Checkpoint, CheckpointId, StepId};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CheckpointStore {
    by_id: DashMap<CheckpointId, Arc<Checkpoint>>,
    by_step: DashMap<StepId, Vec<CheckpointId>>,
}

impl CheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a checkpoint; committing the same address twice is a no-op
    ///
    /// Returns the stored checkpoint, which is the earlier one on a repeat.
    pub fn commit(&self, checkpoint: Checkpoint) -> Arc<Checkpoint> {
        let id = checkpoint.id;
        let step = checkpoint.step_id.clone();
        let mut inserted = false;
        let stored = self
            .by_id
            .entry(id)
            .or_insert_with(|| {
                inserted = true;
                Arc::new(checkpoint)
            })
            .clone();
        if inserted {
            self.by_step.entry(step).or_default().push(id);
        }
        stored
    }

    #[must_use]
    pub fn get(&self, id: &CheckpointId) -> Option<Arc<Checkpoint>> {
        self.by_id.get(id).map(|c| Arc::clone(&c))
    }

    /// Most recent checkpoint committed for a step
    #[must_use]
    pub fn latest(&self, step: &StepId) -> Option<Arc<Checkpoint>> {
        let id = *self.by_step.get(step)?.last()?;
        self.get(&id)
    }

    /// Every checkpoint of a step, oldest first
    #[must_use]
    pub fn history(&self, step: &StepId) -> Vec<Arc<Checkpoint>> {
        let ids = self
            .by_step
            .get(step)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroplan_model::{ContentHash, Outputs};

    #[test]
    fn recommit_is_idempotent_and_history_grows_on_change() {
        let store = CheckpointStore::new();
        let step = StepId::new("s");
        let first = Checkpoint::new(step.clone(), 0, ContentHash::compute(b"a"), Outputs::new(), None);
        let again = Checkpoint::new(step.clone(), 3, ContentHash::compute(b"a"), Outputs::new(), None);
        let a = store.commit(first);
        let b = store.commit(again);
        assert_eq!(a.id, b.id);
        assert_eq!(b.plan_version, 0);
        assert_eq!(store.len(), 1);

        let replacement = Checkpoint::new(
            step.clone(),
            1,
            ContentHash::compute(b"b"),
            Outputs::new(),
            Some(a.id),
        );
        store.commit(replacement);
        let history = store.history(&step);
        assert_eq!(history.len(), 2);
        assert_eq!(store.latest(&step).unwrap().supersedes, Some(a.id));
    }
}
