//! Input binding resolution
//!
//! Substitutes literals, task inputs, prior step outputs and templates
//! with concrete values before a capability is invoked.

use crate::error::BindingError;
use retroplan_model::{render_template, Binding, Outputs, Scope, StepId, INPUT_NAMESPACE};
use serde_json::Value;
use std::collections::BTreeMap;

/// Resolve every binding of a contract or undo action
///
/// # Errors
/// Returns the first binding that cannot be resolved
pub fn resolve_inputs(
    bindings: &BTreeMap<String, Binding>,
    scope: &Scope<'_>,
) -> Result<Outputs, BindingError> {
    bindings
        .iter()
        .map(|(key, binding)| Ok((key.clone(), resolve(binding, scope)?)))
        .collect()
}

/// Resolve one binding
///
/// # Errors
/// Returns error if the referenced input or output does not exist
pub fn resolve(binding: &Binding, scope: &Scope<'_>) -> Result<Value, BindingError> {
    match binding {
        Binding::Literal { value } => Ok(value.clone()),
        Binding::Input { key } => scope
            .lookup(&format!("{INPUT_NAMESPACE}.{key}"))
            .cloned()
            .ok_or_else(|| BindingError::MissingInput(key.clone())),
        Binding::Ref { step, key } => scope
            .lookup(&format!("{step}.{key}"))
            .cloned()
            .ok_or_else(|| BindingError::MissingOutput {
                step: step.clone(),
                key: key.clone(),
            }),
        Binding::Template { template } => {
            render_template(template, |path| lookup_path(scope, path).map(render_value))
                .map(Value::String)
        }
    }
}

fn lookup_path<'a>(scope: &Scope<'a>, path: &str) -> Result<&'a Value, BindingError> {
    let (head, rest) = path
        .split_once('.')
        .ok_or_else(|| BindingError::InvalidPath(path.to_string()))?;
    scope.lookup(path).ok_or_else(|| {
        if head == INPUT_NAMESPACE {
            BindingError::MissingInput(rest.to_string())
        } else {
            BindingError::MissingOutput {
                step: StepId::new(head),
                key: rest.to_string(),
            }
        }
    })
}

/// Strings render bare, everything else as compact JSON
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(v: Value) -> Outputs {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn resolves_each_binding_kind() {
        let inputs = outputs(json!({"topic": "rust"}));
        let steps = BTreeMap::from([(
            StepId::new("fetch"),
            outputs(json!({"doc": {"title": "Ownership", "pages": 3}})),
        )]);
        let scope = Scope::new(&inputs, &steps);

        let bindings = BTreeMap::from([
            ("a".to_string(), Binding::literal(json!(1))),
            ("b".to_string(), Binding::input("topic")),
            ("c".to_string(), Binding::output("fetch", "doc.title")),
            (
                "d".to_string(),
                Binding::template("{{ input.topic }}: {{fetch.doc.title}} ({{ fetch.doc.pages }}p)"),
            ),
        ]);
        let resolved = resolve_inputs(&bindings, &scope).unwrap();
        assert_eq!(resolved["a"], json!(1));
        assert_eq!(resolved["b"], json!("rust"));
        assert_eq!(resolved["c"], json!("Ownership"));
        assert_eq!(resolved["d"], json!("rust: Ownership (3p)"));
    }

    #[test]
    fn missing_references_are_errors() {
        let inputs = Outputs::new();
        let steps = BTreeMap::new();
        let scope = Scope::new(&inputs, &steps);
        assert_eq!(
            resolve(&Binding::input("q"), &scope),
            Err(BindingError::MissingInput("q".into()))
        );
        assert_eq!(
            resolve(&Binding::template("{{ fetch.body }}"), &scope),
            Err(BindingError::MissingOutput {
                step: "fetch".into(),
                key: "body".into()
            })
        );
    }
}
