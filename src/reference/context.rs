//! Resolution context carried through reference evaluation

use std::collections::HashMap;

use serde_json::Value;

use super::ast::{Reference, ResolveError};

/// Everything a reference can resolve against: completed step outputs, the
/// workflow's input, an optional `forEach` item/index binding, and — only
/// when resolving trigger input after completion — the workflow's final
/// output.
///
/// `item` is owned rather than borrowed: iterations are driven from cloned
/// values (see [`crate::step::run_foreach`]), so tying it to `'a` like the
/// other fields would force every iteration's binding to outlive the whole
/// context.
#[derive(Debug, Clone)]
pub struct RefContext<'a> {
    step_outputs: &'a HashMap<String, Value>,
    input: &'a Value,
    item: Option<Value>,
    index: Option<usize>,
    output: Option<&'a Value>,
}

impl<'a> RefContext<'a> {
    pub fn new(step_outputs: &'a HashMap<String, Value>, input: &'a Value) -> Self {
        Self {
            step_outputs,
            input,
            item: None,
            index: None,
            output: None,
        }
    }

    /// Bind the current `forEach` iteration's item and index, producing a
    /// fresh context (each iteration gets its own binding).
    pub fn with_iteration(&self, item: Value, index: usize) -> Self {
        Self {
            step_outputs: self.step_outputs,
            input: self.input,
            item: Some(item),
            index: Some(index),
            output: self.output,
        }
    }

    /// Bind the workflow's finalized output, for trigger resolution.
    pub fn with_output(&self, output: &'a Value) -> Self {
        Self {
            output: Some(output),
            ..self.clone()
        }
    }

    pub fn resolve(&self, reference: &Reference) -> Result<Value, ResolveError> {
        match reference {
            Reference::Input(path) => resolve_path("@input", self.input, path),
            Reference::Output(path) => match self.output {
                Some(v) => resolve_path("@output", v, path),
                None => Err(ResolveError::OutputNotBound),
            },
            Reference::Item(path) => match &self.item {
                Some(v) => resolve_path("@item", v, path),
                None => Err(ResolveError::NotBound("@item")),
            },
            Reference::Index => self
                .index
                .map(|i| Value::from(i))
                .ok_or(ResolveError::NotBound("@index")),
            Reference::Step(name, path) => {
                let output = self
                    .step_outputs
                    .get(name)
                    .ok_or_else(|| ResolveError::UnknownStep(name.clone()))?;
                resolve_path(name, output, path)
            }
        }
    }
}

fn resolve_path(reference_label: &str, root: &Value, path: &[String]) -> Result<Value, ResolveError> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| ResolveError::UnknownPath {
                reference: reference_label.to_string(),
                segment: segment.clone(),
            })?,
            Value::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| ResolveError::TypeMismatch {
                    reference: reference_label.to_string(),
                    segment: segment.clone(),
                })?;
                items.get(idx).ok_or_else(|| ResolveError::UnknownPath {
                    reference: reference_label.to_string(),
                    segment: segment.clone(),
                })?
            }
            _ => {
                return Err(ResolveError::TypeMismatch {
                    reference: reference_label.to_string(),
                    segment: segment.clone(),
                })
            }
        };
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_input_path() {
        let outputs = HashMap::new();
        let input = json!({"user": {"name": "ada"}});
        let ctx = RefContext::new(&outputs, &input);
        assert_eq!(
            ctx.resolve(&Reference::Input(vec!["user".into(), "name".into()]))
                .unwrap(),
            json!("ada")
        );
    }

    #[test]
    fn array_index_path() {
        let outputs = HashMap::new();
        let input = json!({"xs": [10, 20, 30]});
        let ctx = RefContext::new(&outputs, &input);
        assert_eq!(
            ctx.resolve(&Reference::Input(vec!["xs".into(), "1".into()]))
                .unwrap(),
            json!(20)
        );
    }

    #[test]
    fn unknown_step_is_an_error() {
        let outputs = HashMap::new();
        let input = json!({});
        let ctx = RefContext::new(&outputs, &input);
        assert!(matches!(
            ctx.resolve(&Reference::Step("missing".into(), vec![])),
            Err(ResolveError::UnknownStep(_))
        ));
    }

    #[test]
    fn scalar_index_is_type_mismatch() {
        let outputs = HashMap::new();
        let input = json!({"n": 1});
        let ctx = RefContext::new(&outputs, &input);
        assert!(matches!(
            ctx.resolve(&Reference::Input(vec!["n".into(), "x".into()])),
            Err(ResolveError::TypeMismatch { .. })
        ));
    }
}
