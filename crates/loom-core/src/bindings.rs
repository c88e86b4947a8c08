//! Resolution of value bindings against a variable scope.

use serde_json::{Map, Value};
use tracing::warn;

use loom_contracts::agent::{PropKey, ValueBinding};

/// Resolve one binding. Missing variables and paths resolve to `null`.
pub fn resolve(binding: &ValueBinding, variables: &Map<String, Value>) -> Value {
    match binding {
        ValueBinding::Literal { value } => value.clone(),
        ValueBinding::Variable {
            from_variable,
            from_variable_prop_path,
        } => {
            let Some(root) = variables.get(from_variable) else {
                warn!(variable = %from_variable, "binding refers to an unknown variable");
                return Value::Null;
            };
            from_variable_prop_path
                .iter()
                .try_fold(root, |value, key| match key {
                    PropKey::Index(i) => value.get(*i),
                    PropKey::Key(k) => value.get(k.as_str()),
                })
                .cloned()
                .unwrap_or(Value::Null)
        }
    }
}

/// Resolve a named set of bindings into a JSON object.
pub fn resolve_all<'a>(
    bindings: impl IntoIterator<Item = (&'a String, &'a ValueBinding)>,
    variables: &Map<String, Value>,
) -> Value {
    Value::Object(
        bindings
            .into_iter()
            .map(|(name, binding)| (name.clone(), resolve(binding, variables)))
            .collect(),
    )
}
