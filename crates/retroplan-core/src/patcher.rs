//! Versioned plan patching
//!
//! The patcher holds the current plan and the append-only patch history
//! behind one lock. Version numbers are issued only while that lock is
//! held, so two concurrent proposals can never produce the same version.

use crate::error::PatchError;
use parking_lot::Mutex;
use retroplan_model::{PatchOp, Plan, PlanPatch, StepId};
use std::sync::Arc;
use tracing::info;

struct Inner {
    plan: Arc<Plan>,
    history: Vec<PlanPatch>,
}

/// Applies patches to produce new immutable plan versions
pub struct PlanPatcher {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for PlanPatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PlanPatcher")
            .field("plan_id", &inner.plan.plan_id)
            .field("version", &inner.plan.version)
            .field("patches", &inner.history.len())
            .finish()
    }
}

impl PlanPatcher {
    /// Start from version 0 of a plan
    #[must_use]
    pub fn new(plan: Plan) -> Self {
        Self {
            inner: Mutex::new(Inner {
                plan: Arc::new(plan),
                history: Vec::new(),
            }),
        }
    }

    /// Current plan version
    #[must_use]
    pub fn current(&self) -> Arc<Plan> {
        Arc::clone(&self.inner.lock().plan)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.lock().plan.version
    }

    /// Every patch applied so far, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<PlanPatch> {
        self.inner.lock().history.clone()
    }

    /// Apply a patch built against some earlier snapshot
    ///
    /// # Errors
    /// Returns [`PatchError::VersionConflict`] if the patch does not derive
    /// from the current version, or [`PatchError::Plan`] if the patched
    /// plan is invalid
    pub fn apply(&self, patch: PlanPatch) -> Result<Arc<Plan>, PatchError> {
        let mut inner = self.inner.lock();
        if patch.from_version != inner.plan.version {
            return Err(PatchError::VersionConflict {
                expected: inner.plan.version,
                actual: patch.from_version,
            });
        }
        let next = Arc::new(inner.plan.apply(&patch)?);
        info!(
            plan_id = %next.plan_id,
            from = patch.from_version,
            to = patch.to_version,
            ops = patch.ops.len(),
            reason = %patch.reason,
            "plan patched"
        );
        inner.plan = Arc::clone(&next);
        inner.history.push(patch);
        Ok(next)
    }

    /// Build a patch against the current version and apply it atomically
    ///
    /// # Errors
    /// Returns [`PatchError::Plan`] if the patched plan is invalid
    pub fn propose(
        &self,
        ops: Vec<PatchOp>,
        reason: impl Into<String>,
    ) -> Result<(Arc<Plan>, PlanPatch), PatchError> {
        let mut inner = self.inner.lock();
        let patch = PlanPatch::new(&inner.plan, ops, reason);
        let next = Arc::new(inner.plan.apply(&patch)?);
        info!(
            plan_id = %next.plan_id,
            from = patch.from_version,
            to = patch.to_version,
            reason = %patch.reason,
            "plan patched"
        );
        inner.plan = Arc::clone(&next);
        inner.history.push(patch.clone());
        Ok((next, patch))
    }

    /// Swap a step for its next alternate contract
    ///
    /// # Errors
    /// Returns [`PatchError::NotPatchable`] if the step is unknown or has
    /// no alternate left
    pub fn apply_alternate(&self, step: &StepId) -> Result<(Arc<Plan>, PlanPatch), PatchError> {
        let replacement = self
            .current()
            .step(step)
            .and_then(retroplan_model::ActionContract::next_alternate)
            .ok_or_else(|| PatchError::NotPatchable(step.clone()))?;
        let reason = format!(
            "alternate: `{step}` now uses `{}`",
            replacement.capability
        );
        self.propose(vec![PatchOp::ReplaceStep { step: replacement }], reason)
    }
}
