//! Checkable assertions over bound values
//!
//! Assertions are plain data so they survive the persisted plan schema.
//! They are evaluated against a [`Scope`]: the task inputs, the outputs of
//! completed steps, and optionally the outputs of the step being checked.
//!
//! Keys are dotted paths:
//! - `input.topic` reads a TaskBrief input
//! - `fetch.body.title` reads output `body.title` of step `fetch`
//! - `summary` reads the current step's own output

use crate::ids::StepId;
use crate::Outputs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Reserved head segment addressing TaskBrief inputs
pub const INPUT_NAMESPACE: &str = "input";

/// Values an assertion can see
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    inputs: &'a Outputs,
    steps: &'a BTreeMap<StepId, Outputs>,
    local: Option<&'a Outputs>,
}

impl<'a> Scope<'a> {
    /// Scope over task inputs and completed step outputs
    #[must_use]
    pub fn new(inputs: &'a Outputs, steps: &'a BTreeMap<StepId, Outputs>) -> Self {
        Self {
            inputs,
            steps,
            local: None,
        }
    }

    /// Attach the outputs of the step under evaluation
    #[must_use]
    pub fn with_local(mut self, local: &'a Outputs) -> Self {
        self.local = Some(local);
        self
    }

    /// Resolve a dotted path to a value
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&'a Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        if head == INPUT_NAMESPACE {
            return walk(self.inputs, rest?);
        }
        if let (Some(outputs), Some(rest)) = (self.steps.get(head), rest) {
            return walk(outputs, rest);
        }
        self.local.and_then(|local| walk(local, path))
    }
}

/// Walk a dotted path through an outputs map
fn walk<'v>(root: &'v Outputs, path: &str) -> Option<&'v Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// JSON value shapes used by type assertions and required outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Null,
    Any,
}

impl ValueType {
    /// Check a value against this shape
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Null => value.is_null(),
            Self::Any => true,
        }
    }
}

/// A checkable assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Assertion {
    /// Key resolves to any value
    Exists { key: String },
    /// Key resolves to exactly `value`
    Equals { key: String, value: Value },
    /// Key is missing or differs from `value`
    NotEquals { key: String, value: Value },
    /// Key is a string matching the regex
    Matches { key: String, pattern: String },
    /// Key is a number within the inclusive bounds
    InRange {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Key is a non-empty string, array or object
    NonEmpty { key: String },
    /// Key has the given JSON shape
    TypeIs {
        key: String,
        #[serde(rename = "type")]
        ty: ValueType,
    },
    /// String contains substring, array contains element, object contains key
    Contains { key: String, value: Value },
    /// Every nested assertion holds
    All { all: Vec<Assertion> },
    /// At least one nested assertion holds
    Any { any: Vec<Assertion> },
    /// The nested assertion fails
    Not { not: Box<Assertion> },
}

/// Why an assertion did not hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionFailure {
    pub detail: String,
}

impl AssertionFailure {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl Assertion {
    /// Evaluate against a scope
    ///
    /// # Errors
    /// Returns the reason the assertion does not hold
    pub fn check(&self, scope: &Scope<'_>) -> Result<(), AssertionFailure> {
        match self {
            Self::Exists { key } => scope
                .lookup(key)
                .map(|_| ())
                .ok_or_else(|| AssertionFailure::new(format!("`{key}` is missing"))),
            Self::Equals { key, value } => {
                let actual = require(scope, key)?;
                if actual == value {
                    Ok(())
                } else {
                    Err(AssertionFailure::new(format!(
                        "`{key}` is {actual}, expected {value}"
                    )))
                }
            }
            Self::NotEquals { key, value } => match scope.lookup(key) {
                Some(actual) if actual == value => Err(AssertionFailure::new(format!(
                    "`{key}` must not equal {value}"
                ))),
                _ => Ok(()),
            },
            Self::Matches { key, pattern } => {
                let re = Regex::new(pattern)
                    .map_err(|e| AssertionFailure::new(format!("invalid pattern: {e}")))?;
                let actual = require(scope, key)?;
                let text = actual
                    .as_str()
                    .ok_or_else(|| AssertionFailure::new(format!("`{key}` is not a string")))?;
                if re.is_match(text) {
                    Ok(())
                } else {
                    Err(AssertionFailure::new(format!(
                        "`{key}` does not match /{pattern}/"
                    )))
                }
            }
            Self::InRange { key, min, max } => {
                let actual = require(scope, key)?;
                let n = actual
                    .as_f64()
                    .ok_or_else(|| AssertionFailure::new(format!("`{key}` is not a number")))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    Err(AssertionFailure::new(format!(
                        "`{key}` = {n} outside [{}, {}]",
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("inf".to_string(), |m| m.to_string()),
                    )))
                } else {
                    Ok(())
                }
            }
            Self::NonEmpty { key } => {
                let empty = match require(scope, key)? {
                    Value::String(s) => s.trim().is_empty(),
                    Value::Array(items) => items.is_empty(),
                    Value::Object(map) => map.is_empty(),
                    Value::Null => true,
                    _ => false,
                };
                if empty {
                    Err(AssertionFailure::new(format!("`{key}` is empty")))
                } else {
                    Ok(())
                }
            }
            Self::TypeIs { key, ty } => {
                let actual = require(scope, key)?;
                if ty.matches(actual) {
                    Ok(())
                } else {
                    Err(AssertionFailure::new(format!("`{key}` is not of type {ty:?}")))
                }
            }
            Self::Contains { key, value } => {
                let found = match (require(scope, key)?, value) {
                    (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                    (Value::Array(items), v) => items.contains(v),
                    (Value::Object(map), Value::String(k)) => map.contains_key(k),
                    _ => false,
                };
                if found {
                    Ok(())
                } else {
                    Err(AssertionFailure::new(format!("`{key}` does not contain {value}")))
                }
            }
            Self::All { all } => all.iter().try_for_each(|a| a.check(scope)),
            Self::Any { any } => {
                let mut reasons = Vec::new();
                for a in any {
                    match a.check(scope) {
                        Ok(()) => return Ok(()),
                        Err(e) => reasons.push(e.detail),
                    }
                }
                Err(AssertionFailure::new(format!(
                    "none held: {}",
                    reasons.join("; ")
                )))
            }
            Self::Not { not } => match not.check(scope) {
                Ok(()) => Err(AssertionFailure::new(format!("negated assertion held: {not:?}"))),
                Err(_) => Ok(()),
            },
        }
    }

    /// Structural validation (regexes compile, bounds ordered)
    ///
    /// # Errors
    /// Returns a description of the first malformed node
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Matches { pattern, .. } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid pattern /{pattern}/: {e}")),
            Self::InRange {
                min: Some(lo),
                max: Some(hi),
                key,
            } if lo > hi => Err(format!("`{key}` range is inverted")),
            Self::All { all: items } | Self::Any { any: items } => {
                items.iter().try_for_each(Assertion::validate)
            }
            Self::Not { not } => not.validate(),
            _ => Ok(()),
        }
    }
}

fn require<'a>(scope: &Scope<'a>, key: &str) -> Result<&'a Value, AssertionFailure> {
    scope
        .lookup(key)
        .ok_or_else(|| AssertionFailure::new(format!("`{key}` is missing")))
}

/// A named assertion used for acceptance tests and gates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    #[serde(flatten)]
    pub assertion: Assertion,
}

impl Check {
    /// Create a named check
    #[must_use]
    pub fn new(name: impl Into<String>, assertion: Assertion) -> Self {
        Self {
            name: name.into(),
            assertion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(value: Value) -> Outputs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn scope_resolves_inputs_steps_and_local() {
        let inputs = outputs(json!({"topic": "rust"}));
        let mut steps = BTreeMap::new();
        steps.insert(StepId::new("fetch"), outputs(json!({"body": {"items": [1, 2]}})));
        let local = outputs(json!({"summary": "ok"}));
        let scope = Scope::new(&inputs, &steps).with_local(&local);

        assert_eq!(scope.lookup("input.topic"), Some(&json!("rust")));
        assert_eq!(scope.lookup("fetch.body.items.1"), Some(&json!(2)));
        assert_eq!(scope.lookup("summary"), Some(&json!("ok")));
        assert_eq!(scope.lookup("fetch"), None);
        assert_eq!(scope.lookup("input"), None);
    }

    #[test]
    fn pii_gate_expressed_as_negated_match() {
        let inputs = Outputs::new();
        let steps = BTreeMap::new();
        let local = outputs(json!({"text": "call me at 555-123-4567"}));
        let scope = Scope::new(&inputs, &steps).with_local(&local);

        let no_phone = Assertion::Not {
            not: Box::new(Assertion::Matches {
                key: "text".into(),
                pattern: r"\d{3}-\d{3}-\d{4}".into(),
            }),
        };
        assert!(no_phone.check(&scope).is_err());
    }

    #[test]
    fn range_and_emptiness() {
        let inputs = Outputs::new();
        let steps = BTreeMap::new();
        let local = outputs(json!({"score": 0.4, "items": []}));
        let scope = Scope::new(&inputs, &steps).with_local(&local);

        let in_range = Assertion::InRange {
            key: "score".into(),
            min: Some(0.5),
            max: None,
        };
        assert!(in_range.check(&scope).is_err());
        assert!(Assertion::NonEmpty { key: "items".into() }.check(&scope).is_err());
        assert!(Assertion::Any {
            any: vec![
                Assertion::Exists { key: "missing".into() },
                Assertion::Exists { key: "score".into() },
            ]
        }
        .check(&scope)
        .is_ok());
    }

    #[test]
    fn validate_rejects_bad_regex_and_inverted_range() {
        assert!(Assertion::Matches {
            key: "k".into(),
            pattern: "(".into()
        }
        .validate()
        .is_err());
        assert!(Assertion::InRange {
            key: "k".into(),
            min: Some(2.0),
            max: Some(1.0)
        }
        .validate()
        .is_err());
    }

    #[test]
    fn check_serializes_flat() {
        let check = Check::new(
            "has summary",
            Assertion::Exists {
                key: "summary".into(),
            },
        );
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json, json!({"name": "has summary", "op": "exists", "key": "summary"}));
        let back: Check = serde_json::from_value(json).unwrap();
        assert_eq!(back, check);
    }
}
