//! Plan patches: the append-only audit log of plan changes

use crate::contract::ActionContract;
use crate::ids::{PlanId, StepId};
use crate::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One structural change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Append a new step
    AddStep {
        step: ActionContract,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        depends_on: Vec<StepId>,
    },
    /// Remove a step and every edge pointing at it
    RemoveStep { id: StepId },
    /// Replace the contract of an existing step (same id)
    ReplaceStep { step: ActionContract },
    /// Overwrite a step's dependency list
    SetDependencies { id: StepId, depends_on: Vec<StepId> },
}

impl PatchOp {
    /// The step id this operation touches
    #[must_use]
    pub fn step_id(&self) -> &StepId {
        match self {
            Self::AddStep { step, .. } | Self::ReplaceStep { step } => &step.id,
            Self::RemoveStep { id } | Self::SetDependencies { id, .. } => id,
        }
    }

    /// Short operation name for logs and events
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddStep { .. } => "add_step",
            Self::RemoveStep { .. } => "remove_step",
            Self::ReplaceStep { .. } => "replace_step",
            Self::SetDependencies { .. } => "set_dependencies",
        }
    }
}

/// A version delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPatch {
    pub plan_id: PlanId,
    pub from_version: u64,
    pub to_version: u64,
    pub ops: Vec<PatchOp>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl PlanPatch {
    /// Patch deriving from exactly `base`'s version
    #[must_use]
    pub fn new(base: &Plan, ops: Vec<PatchOp>, reason: impl Into<String>) -> Self {
        Self {
            plan_id: base.plan_id,
            from_version: base.version,
            to_version: base.version + 1,
            ops,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    /// Step ids touched by this patch
    #[must_use]
    pub fn touched_steps(&self) -> Vec<&StepId> {
        self.ops.iter().map(PatchOp::step_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brief::TaskBrief;

    #[test]
    fn patch_targets_next_version() {
        let plan = Plan::sequential(
            TaskBrief::new("t"),
            vec![ActionContract::new("a", "a", "tool")],
        )
        .unwrap();
        let patch = PlanPatch::new(
            &plan,
            vec![PatchOp::AddStep {
                step: ActionContract::new("b", "b", "tool"),
                depends_on: vec![StepId::new("a")],
            }],
            "extend",
        );
        assert_eq!((patch.from_version, patch.to_version), (0, 1));
        assert_eq!(patch.touched_steps(), vec![&StepId::new("b")]);
    }

    #[test]
    fn ops_serialize_with_tag() {
        let op = PatchOp::RemoveStep { id: StepId::new("x") };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"remove_step","id":"x"}"#);
        assert_eq!(op.kind(), "remove_step");
    }
}
