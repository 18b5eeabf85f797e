//! Template resolution: walk a JSON-like value substituting `@` references

use std::collections::HashSet;

use serde_json::Value;

use super::ast::{Reference, ResolveError};
use super::context::RefContext;
use super::parser;

/// One failed reference inside a template, kept alongside the (partially)
/// resolved value rather than aborting the whole resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    pub token: String,
    pub error: ResolveError,
}

/// Result of resolving a template: the best-effort resolved value plus any
/// references that failed along the way.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub value: Value,
    pub errors: Vec<TemplateError>,
}

impl Resolved {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Recursively resolve every `@` reference in `template` against `ctx`.
///
/// - A string that *is* a reference literal resolves to the native value.
/// - A string *containing* `@...` tokens has each token substituted with its
///   stringified value; unresolved tokens are left intact in the output.
/// - Arrays and objects recurse; other scalars pass through unchanged.
pub fn resolve_template(template: &Value, ctx: &RefContext<'_>) -> Resolved {
    match template {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut errors = Vec::new();
            for item in items {
                let resolved = resolve_template(item, ctx);
                out.push(resolved.value);
                errors.extend(resolved.errors);
            }
            Resolved {
                value: Value::Array(out),
                errors,
            }
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            let mut errors = Vec::new();
            for (key, value) in map {
                let resolved = resolve_template(value, ctx);
                out.insert(key.clone(), resolved.value);
                errors.extend(resolved.errors);
            }
            Resolved {
                value: Value::Object(out),
                errors,
            }
        }
        other => Resolved {
            value: other.clone(),
            errors: Vec::new(),
        },
    }
}

fn resolve_string(s: &str, ctx: &RefContext<'_>) -> Resolved {
    if parser::is_whole_reference(s) {
        let reference = parser::parse_reference(s).expect("is_whole_reference implies parse succeeds");
        return match ctx.resolve(&reference) {
            Ok(value) => Resolved {
                value,
                errors: Vec::new(),
            },
            Err(error) => Resolved {
                value: Value::Null,
                errors: vec![TemplateError {
                    token: s.to_string(),
                    error,
                }],
            },
        };
    }

    let tokens = parser::scan_tokens(s);
    if tokens.is_empty() {
        return Resolved {
            value: Value::String(s.to_string()),
            errors: Vec::new(),
        };
    }

    let mut out = String::with_capacity(s.len());
    let mut errors = Vec::new();
    let mut cursor = 0;
    for token in &tokens {
        out.push_str(&s[cursor..token.start]);
        match ctx.resolve(&token.reference) {
            Ok(value) => out.push_str(&stringify(&value)),
            Err(error) => {
                // Keep the unresolved token text intact rather than dropping it.
                out.push_str(&s[token.start..token.end]);
                errors.push(TemplateError {
                    token: s[token.start..token.end].to_string(),
                    error,
                });
            }
        }
        cursor = token.end;
    }
    out.push_str(&s[cursor..]);

    Resolved {
        value: Value::String(out),
        errors,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Extract the set of step names referenced anywhere in `template`. Used by
/// the control-flow engine to build the step-dependency graph.
pub fn extract_dependencies(template: &Value) -> HashSet<String> {
    let mut deps = HashSet::new();
    collect_dependencies(template, &mut deps);
    deps
}

fn collect_dependencies(template: &Value, deps: &mut HashSet<String>) {
    match template {
        Value::String(s) => {
            if parser::is_whole_reference(s) {
                if let Some(Reference::Step(name, _)) = parser::parse_reference(s) {
                    deps.insert(name);
                }
            } else {
                for token in parser::scan_tokens(s) {
                    if let Reference::Step(name, _) = token.reference {
                        deps.insert(name);
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_dependencies(v, deps)),
        Value::Object(map) => map.values().for_each(|v| collect_dependencies(v, deps)),
        _ => {}
    }
}
