//! Action contracts: one planned step and everything declared about it

use crate::assertion::{Assertion, Check, ValueType, INPUT_NAMESPACE};
use crate::ids::{CapabilityId, StepId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Placeholder syntax used by template bindings: `{{ step.key }}`
fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)+)\s*\}\}")
            .unwrap_or_else(|e| unreachable!("placeholder regex is static: {e}"))
    })
}

/// Dotted paths referenced by a template string, in order of appearance
#[must_use]
pub fn template_paths(template: &str) -> Vec<&str> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Replace each placeholder in `template` using `resolve`
///
/// # Errors
/// Propagates the first error returned by `resolve`
pub fn render_template<E>(
    template: &str,
    mut resolve: impl FnMut(&str) -> Result<String, E>,
) -> Result<String, E> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(template) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&resolve(path.as_str())?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Where an input value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum Binding {
    /// A constant
    Literal { value: Value },
    /// A TaskBrief input
    Input { key: String },
    /// An output of an earlier step; `key` may be a dotted path
    Ref { step: StepId, key: String },
    /// A string with `{{ step.key }}` / `{{ input.key }}` placeholders
    Template { template: String },
}

impl Binding {
    /// Literal binding
    #[must_use]
    pub fn literal(value: Value) -> Self {
        Self::Literal { value }
    }

    /// Reference to an output of `step`
    #[must_use]
    pub fn output(step: impl Into<StepId>, key: impl Into<String>) -> Self {
        Self::Ref {
            step: step.into(),
            key: key.into(),
        }
    }

    /// Reference to a task input
    #[must_use]
    pub fn input(key: impl Into<String>) -> Self {
        Self::Input { key: key.into() }
    }

    /// Template binding
    #[must_use]
    pub fn template(template: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
        }
    }

    /// Steps whose outputs this binding reads
    #[must_use]
    pub fn referenced_steps(&self) -> BTreeSet<StepId> {
        match self {
            Self::Ref { step, .. } => BTreeSet::from([step.clone()]),
            Self::Template { template } => template_paths(template)
                .into_iter()
                .filter_map(|path| path.split_once('.').map(|(head, _)| head))
                .filter(|head| *head != INPUT_NAMESPACE)
                .map(StepId::from)
                .collect(),
            Self::Literal { .. } | Self::Input { .. } => BTreeSet::new(),
        }
    }
}

/// A validation to run asynchronously after the step succeeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectSpec {
    pub name: String,
    pub checks: Vec<RetroCheck>,
    #[serde(default)]
    pub on_fail: OnFailPolicy,
    /// Overrides the policy retrospect timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RetrospectSpec {
    /// Create a retrospect with default failure policy
    #[must_use]
    pub fn new(name: impl Into<String>, checks: Vec<RetroCheck>) -> Self {
        Self {
            name: name.into(),
            checks,
            on_fail: OnFailPolicy::default(),
            timeout_ms: None,
        }
    }

    /// With a failure policy
    #[must_use]
    pub fn on_fail(mut self, on_fail: OnFailPolicy) -> Self {
        self.on_fail = on_fail;
        self
    }

    /// With a timeout override
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// One retrospect check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RetroCheck {
    /// Required keys with their shapes
    Schema {
        required: BTreeMap<String, ValueType>,
    },
    /// Array at `key` has no duplicate elements (or no duplicate `by` fields)
    NoDuplicates {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },
    /// Output `key` equals output `other_key` of `other_step`
    Consistency {
        key: String,
        other_step: StepId,
        other_key: String,
    },
    /// Arbitrary assertion over the artifact and completed outputs
    Assert { assertion: Assertion },
    /// A check registered by name with the retrospect runner
    Custom {
        name: String,
        #[serde(default)]
        params: Value,
    },
}

/// What to do when a retrospect fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnFailPolicy {
    /// Invalidate everything downstream of the artifact, not just the artifact
    #[serde(default = "default_true")]
    pub invalidate_downstream: bool,
    /// Restart the replay at this step instead of the checked step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_from: Option<StepId>,
}

fn default_true() -> bool {
    true
}

impl Default for OnFailPolicy {
    fn default() -> Self {
        Self {
            invalidate_downstream: true,
            replay_from: None,
        }
    }
}

/// One compensating action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoAction {
    pub capability: CapabilityId,
    #[serde(default)]
    pub inputs: BTreeMap<String, Binding>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl UndoAction {
    /// Compensation invoking `capability`
    #[must_use]
    pub fn new(capability: impl Into<CapabilityId>) -> Self {
        Self {
            capability: capability.into(),
            inputs: BTreeMap::new(),
            description: String::new(),
        }
    }

    /// With an input binding
    #[must_use]
    pub fn bind(mut self, key: impl Into<String>, binding: Binding) -> Self {
        self.inputs.insert(key.into(), binding);
        self
    }
}

/// One planned step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContract {
    pub id: StepId,
    pub intent: String,
    pub capability: CapabilityId,
    #[serde(default)]
    pub inputs: BTreeMap<String, Binding>,
    /// Output keys the capability must produce
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postconditions: Vec<Assertion>,
    /// Step-level acceptance tests (soft; feed drift)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance: Vec<Check>,
    /// Step-level hard stops
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<Check>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrospects: Vec<RetrospectSpec>,
    /// Undo actions, executed in reverse order on invalidation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation: Vec<UndoAction>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_retro_green: bool,
    /// Fallback contracts tried in order on `alternate`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<ActionContract>,
    /// Overrides the policy retry limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Overrides the policy step timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionContract {
    /// Create a step invoking `capability`
    #[must_use]
    pub fn new(
        id: impl Into<StepId>,
        intent: impl Into<String>,
        capability: impl Into<CapabilityId>,
    ) -> Self {
        Self {
            id: id.into(),
            intent: intent.into(),
            capability: capability.into(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            acceptance: Vec::new(),
            gates: Vec::new(),
            retrospects: Vec::new(),
            compensation: Vec::new(),
            requires_retro_green: false,
            alternates: Vec::new(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// With an input binding
    #[must_use]
    pub fn bind(mut self, key: impl Into<String>, binding: Binding) -> Self {
        self.inputs.insert(key.into(), binding);
        self
    }

    /// With declared output keys
    #[must_use]
    pub fn produces<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(keys.into_iter().map(Into::into));
        self
    }

    /// With a precondition
    #[must_use]
    pub fn requires(mut self, assertion: Assertion) -> Self {
        self.preconditions.push(assertion);
        self
    }

    /// With a postcondition
    #[must_use]
    pub fn ensures(mut self, assertion: Assertion) -> Self {
        self.postconditions.push(assertion);
        self
    }

    /// With a step acceptance test
    #[must_use]
    pub fn accepts(mut self, check: Check) -> Self {
        self.acceptance.push(check);
        self
    }

    /// With a step gate
    #[must_use]
    pub fn gated_by(mut self, check: Check) -> Self {
        self.gates.push(check);
        self
    }

    /// With a retrospect
    #[must_use]
    pub fn with_retrospect(mut self, spec: RetrospectSpec) -> Self {
        self.retrospects.push(spec);
        self
    }

    /// With a compensating action
    #[must_use]
    pub fn compensated_by(mut self, action: UndoAction) -> Self {
        self.compensation.push(action);
        self
    }

    /// Require all retrospects to pass before promotion
    #[must_use]
    pub fn requiring_retro_green(mut self) -> Self {
        self.requires_retro_green = true;
        self
    }

    /// With an alternate contract
    #[must_use]
    pub fn with_alternate(mut self, alternate: ActionContract) -> Self {
        self.alternates.push(alternate);
        self
    }

    /// With a retry limit override
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// With a timeout override
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Whether executing this step has side effects to undo
    #[inline]
    #[must_use]
    pub fn is_compensable(&self) -> bool {
        !self.compensation.is_empty()
    }

    /// Steps whose outputs this contract reads through its bindings
    #[must_use]
    pub fn referenced_steps(&self) -> BTreeSet<StepId> {
        self.inputs
            .values()
            .chain(self.compensation.iter().flat_map(|u| u.inputs.values()))
            .flat_map(Binding::referenced_steps)
            .collect()
    }

    /// Steps read by the input bindings alone
    #[must_use]
    pub fn input_references(&self) -> BTreeSet<StepId> {
        self.inputs
            .values()
            .flat_map(Binding::referenced_steps)
            .collect()
    }

    /// Every capability this contract may invoke, including alternates and compensation
    #[must_use]
    pub fn capabilities(&self) -> BTreeSet<CapabilityId> {
        let mut caps = BTreeSet::from([self.capability.clone()]);
        caps.extend(self.compensation.iter().map(|u| u.capability.clone()));
        for alternate in &self.alternates {
            caps.extend(alternate.capabilities());
        }
        caps
    }

    /// The contract that replaces this one on `alternate`
    ///
    /// The first alternate takes over the step id and inherits the
    /// remaining alternates; `None` when no alternate is left.
    #[must_use]
    pub fn next_alternate(&self) -> Option<ActionContract> {
        let (first, rest) = self.alternates.split_first()?;
        let mut next = first.clone();
        next.id = self.id.clone();
        next.alternates = rest.to_vec();
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_refs_skip_inputs() {
        let binding = Binding::template("{{ fetch.body }} about {{input.topic}} and {{ rank.top.0 }}");
        let steps = binding.referenced_steps();
        assert_eq!(
            steps,
            BTreeSet::from([StepId::new("fetch"), StepId::new("rank")])
        );
    }

    #[test]
    fn render_template_substitutes_in_order() {
        let rendered: Result<String, ()> =
            render_template("a={{ x.a }}, b={{x.b}}!", |path| Ok(path.to_uppercase()));
        assert_eq!(rendered.unwrap(), "a=X.A, b=X.B!");
    }

    #[test]
    fn next_alternate_keeps_step_id_and_shifts_list() {
        let step = ActionContract::new("s1", "primary", "search.fast")
            .with_alternate(ActionContract::new("alt-a", "first", "search.deep"))
            .with_alternate(ActionContract::new("alt-b", "second", "search.cached"));

        let next = step.next_alternate().unwrap();
        assert_eq!(next.id, StepId::new("s1"));
        assert_eq!(next.capability, CapabilityId::new("search.deep"));
        assert_eq!(next.alternates.len(), 1);

        let last = next.next_alternate().unwrap();
        assert!(last.next_alternate().is_none());
    }

    #[test]
    fn capabilities_include_compensation_and_alternates() {
        let step = ActionContract::new("s1", "write", "db.insert")
            .compensated_by(UndoAction::new("db.delete"))
            .with_alternate(ActionContract::new("s1b", "write", "db.upsert"));
        let caps: Vec<_> = step.capabilities().into_iter().map(|c| c.to_string()).collect();
        assert_eq!(caps, vec!["db.delete", "db.insert", "db.upsert"]);
    }

    #[test]
    fn contract_roundtrips_through_yaml() {
        let step = ActionContract::new("s2", "summarize", "llm.summarize")
            .bind("text", Binding::output("s1", "body"))
            .bind("style", Binding::literal(json!("brief")))
            .produces(["summary"])
            .with_retrospect(RetrospectSpec::new(
                "dedupe",
                vec![RetroCheck::NoDuplicates {
                    key: "summary".into(),
                    by: None,
                }],
            ))
            .requiring_retro_green();

        let yaml = serde_yaml::to_string(&step).unwrap();
        let back: ActionContract = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, step);
    }
}
