//! Versioned, immutable execution plans
//!
//! A [`Plan`] is never edited in place: [`Plan::apply`] consumes a
//! [`PlanPatch`] and returns the next version, validated from scratch.

use crate::assertion::INPUT_NAMESPACE;
use crate::brief::TaskBrief;
use crate::contract::ActionContract;
use crate::error::PlanError;
use crate::hash::{ContentHash, HashError};
use crate::ids::{PlanId, StepId};
use crate::patch::{PatchOp, PlanPatch};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One immutable version of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub version: u64,
    pub brief: TaskBrief,
    /// Steps in authoring order; ties in the schedule break by this order
    pub steps: Vec<ActionContract>,
    /// Step id -> ids it depends on
    #[serde(default)]
    pub dependencies: BTreeMap<StepId, Vec<StepId>>,
}

impl Plan {
    /// Build and validate version 0 of a new plan
    ///
    /// # Errors
    /// Returns the first structural problem found
    pub fn new(
        brief: TaskBrief,
        steps: Vec<ActionContract>,
        dependencies: BTreeMap<StepId, Vec<StepId>>,
    ) -> Result<Self, PlanError> {
        let plan = Self {
            plan_id: PlanId::new(),
            version: 0,
            brief,
            steps,
            dependencies,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Build a strictly sequential plan (each step depends on the previous)
    ///
    /// # Errors
    /// Returns the first structural problem found
    pub fn sequential(brief: TaskBrief, steps: Vec<ActionContract>) -> Result<Self, PlanError> {
        let dependencies = steps
            .windows(2)
            .map(|pair| (pair[1].id.clone(), vec![pair[0].id.clone()]))
            .collect();
        Self::new(brief, steps, dependencies)
    }

    /// Validate ids, dependencies, acyclicity, bindings and assertions
    ///
    /// # Errors
    /// Returns the first structural problem found
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut ids = BTreeSet::new();
        for step in &self.steps {
            let raw = step.id.as_str();
            if raw.is_empty() || raw.contains('.') || raw == INPUT_NAMESPACE {
                return Err(PlanError::InvalidStepId(step.id.clone()));
            }
            if !ids.insert(step.id.clone()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for step in &self.steps {
            graph.add_node(step.id.as_str());
        }
        for (step, deps) in &self.dependencies {
            if !ids.contains(step) {
                return Err(PlanError::UnknownStep(step.clone()));
            }
            for dep in deps {
                if dep == step {
                    return Err(PlanError::SelfDependency(step.clone()));
                }
                if !ids.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        step: step.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph.add_edge(dep.as_str(), step.as_str(), ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            return Err(PlanError::Cycle(StepId::new(cycle.node_id())));
        }

        for step in &self.steps {
            let ancestors = self.ancestors(&step.id);
            for contract in std::iter::once(step).chain(&step.alternates) {
                // undo actions may read the step's own outputs
                let inputs = contract.input_references();
                if let Some(referenced) = contract
                    .referenced_steps()
                    .into_iter()
                    .find(|r| !ancestors.contains(r) && (*r != step.id || inputs.contains(r)))
                {
                    return Err(PlanError::DanglingReference {
                        step: step.id.clone(),
                        referenced,
                    });
                }
            }
            let assertions = step.preconditions.iter().chain(&step.postconditions).chain(
                step.acceptance
                    .iter()
                    .chain(&step.gates)
                    .map(|c| &c.assertion),
            );
            for assertion in assertions {
                assertion
                    .validate()
                    .map_err(|detail| PlanError::InvalidAssertion {
                        step: step.id.clone(),
                        detail,
                    })?;
            }
        }
        Ok(())
    }

    /// Look up a step
    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&ActionContract> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Whether a step exists
    #[must_use]
    pub fn contains(&self, id: &StepId) -> bool {
        self.step(id).is_some()
    }

    /// Direct dependencies of a step
    #[must_use]
    pub fn dependencies_of(&self, id: &StepId) -> &[StepId] {
        self.dependencies.get(id).map_or(&[], Vec::as_slice)
    }

    /// Steps that list `id` as a direct dependency
    #[must_use]
    pub fn dependents_of(&self, id: &StepId) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| self.dependencies_of(&s.id).contains(id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Transitive dependencies of a step (excluding itself)
    #[must_use]
    pub fn ancestors(&self, id: &StepId) -> BTreeSet<StepId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<StepId> = self.dependencies_of(id).iter().cloned().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependencies_of(&next).iter().cloned());
            }
        }
        seen
    }

    /// Transitive dependents of a step (excluding itself)
    #[must_use]
    pub fn descendants(&self, id: &StepId) -> BTreeSet<StepId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<StepId> = self.dependents_of(id).into_iter().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents_of(&next));
            }
        }
        seen
    }

    /// Deterministic topological order (ties broken by authoring order)
    #[must_use]
    pub fn topological_order(&self) -> Vec<StepId> {
        let mut done = BTreeSet::new();
        let mut order = Vec::with_capacity(self.steps.len());
        while order.len() < self.steps.len() {
            let ready = self.ready_steps(&done, &BTreeSet::new());
            let Some(next) = ready.into_iter().next() else {
                break;
            };
            done.insert(next.clone());
            order.push(next);
        }
        order
    }

    /// Steps whose dependencies are all in `completed`, excluding `completed`
    /// and `exclude`, in authoring order
    #[must_use]
    pub fn ready_steps(
        &self,
        completed: &BTreeSet<StepId>,
        exclude: &BTreeSet<StepId>,
    ) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.id) && !exclude.contains(&s.id))
            .filter(|s| self.dependencies_of(&s.id).iter().all(|d| completed.contains(d)))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Apply a patch, producing the next version
    ///
    /// # Errors
    /// Returns error if the patch does not derive from this exact version
    /// or the resulting plan is invalid
    pub fn apply(&self, patch: &PlanPatch) -> Result<Plan, PlanError> {
        if patch.plan_id != self.plan_id {
            return Err(PlanError::PlanMismatch {
                plan: self.plan_id,
                patch: patch.plan_id,
            });
        }
        if patch.from_version != self.version {
            return Err(PlanError::VersionMismatch {
                current: self.version,
                from: patch.from_version,
            });
        }
        if patch.to_version != self.version + 1 {
            return Err(PlanError::VersionGap {
                expected: self.version + 1,
                actual: patch.to_version,
            });
        }

        let mut next = self.clone();
        next.version = patch.to_version;
        for op in &patch.ops {
            next.apply_op(op)?;
        }
        next.validate()?;
        Ok(next)
    }

    fn apply_op(&mut self, op: &PatchOp) -> Result<(), PlanError> {
        match op {
            PatchOp::AddStep { step, depends_on } => {
                if self.contains(&step.id) {
                    return Err(PlanError::StepExists(step.id.clone()));
                }
                self.steps.push(step.clone());
                if !depends_on.is_empty() {
                    self.dependencies.insert(step.id.clone(), depends_on.clone());
                }
            }
            PatchOp::RemoveStep { id } => {
                let before = self.steps.len();
                self.steps.retain(|s| &s.id != id);
                if self.steps.len() == before {
                    return Err(PlanError::UnknownStep(id.clone()));
                }
                self.dependencies.remove(id);
                for deps in self.dependencies.values_mut() {
                    deps.retain(|d| d != id);
                }
            }
            PatchOp::ReplaceStep { step } => {
                let slot = self
                    .steps
                    .iter_mut()
                    .find(|s| s.id == step.id)
                    .ok_or_else(|| PlanError::UnknownStep(step.id.clone()))?;
                *slot = step.clone();
            }
            PatchOp::SetDependencies { id, depends_on } => {
                if !self.contains(id) {
                    return Err(PlanError::UnknownStep(id.clone()));
                }
                if depends_on.is_empty() {
                    self.dependencies.remove(id);
                } else {
                    self.dependencies.insert(id.clone(), depends_on.clone());
                }
            }
        }
        Ok(())
    }

    /// Hash of the full plan content, for audit records
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn content_hash(&self) -> Result<ContentHash, HashError> {
        ContentHash::of_serializable(self)
    }
}
