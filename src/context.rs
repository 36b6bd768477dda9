use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{RenderError, Result};
use crate::functions::{self, Callable};
use crate::RenderMode;

/// A context is an ordered mapping from names to values. Iteration order is
/// deterministic (sorted by key).
pub type Context = BTreeMap<String, Value>;

/// Depth cap for the resolver walk and for flattening. Context data deeper
/// than this fails the render instead of recursing further.
pub(crate) const MAX_DEPTH: usize = 32;

/// A context value. Callables are an explicit tagged case; nothing in the
/// crate inspects runtime type names to discover them.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Sequence(Vec<Value>),
    Mapping(Context),
    Callable(Callable),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Context> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => a == b,
            // Callables compare by identity of the underlying function plus
            // their pre-bound arguments.
            (Value::Callable(a), Value::Callable(b)) => {
                Arc::ptr_eq(a.func_arc(), b.func_arc()) && a.bound() == b.bound()
            }
            _ => false,
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::{Error, SerializeMap, SerializeSeq};
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Mapping(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Callable(c) => Err(S::Error::custom(format!(
                "callable `{}` has no serialized form",
                c.name()
            ))),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Mapping(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<Callable> for Value {
    fn from(c: Callable) -> Self {
        Value::Callable(c)
    }
}

/// Build a context from a JSON object; anything but an object yields an
/// empty context.
pub fn from_json(value: serde_json::Value) -> Context {
    match Value::from(value) {
        Value::Mapping(m) => m,
        _ => Context::new(),
    }
}

/// Merge context layers by precedence and resolve templated values.
///
/// Layers, low to high: `builtins`, `extra`, then `file_context`. When
/// `file_context_from` names a mapping-valued key of `file_context`, that
/// sub-mapping replaces the whole file layer before the merge. Merging is
/// shallow: a higher layer fully overwrites a same-keyed lower entry.
///
/// After merging, every callable entry is partially bound against the
/// merged context (see `functions::adapt`), and every string leaf is
/// re-rendered once in `mode` against the merged context. The walk is a
/// single pass over a pre-resolution snapshot: a value referencing another
/// still-templated value resolves one level deep, and the leftover markers
/// stay verbatim.
pub fn resolve(
    builtins: &Context,
    extra: &Context,
    file_context: &Context,
    file_context_from: Option<&str>,
    injectable: &BTreeSet<String>,
    mode: RenderMode,
) -> Result<Context> {
    let mut merged = builtins.clone();
    merged.extend(extra.clone());

    let file_layer = match file_context_from.and_then(|key| file_context.get(key)) {
        Some(Value::Mapping(sub)) => sub.clone(),
        _ => file_context.clone(),
    };
    merged.extend(file_layer);
    debug!(
        entries = merged.len(),
        from = file_context_from.unwrap_or(""),
        "resolved context layers"
    );

    let snapshot = merged.clone();
    for value in merged.values_mut() {
        if let Value::Callable(callable) = value {
            *callable = functions::adapt(callable.clone(), &snapshot, injectable);
        }
    }

    let snapshot = merged.clone();
    merged
        .into_iter()
        .map(|(key, value)| {
            let rendered = render_value(&key, value, &snapshot, mode, 0)?;
            Ok((key, rendered))
        })
        .collect()
}

// Pure transform: returns a new value, never mutates shared structure.
fn render_value(
    path: &str,
    value: Value,
    vars: &Context,
    mode: RenderMode,
    depth: usize,
) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(RenderError::RecursionLimit {
            key: path.to_string(),
        });
    }
    Ok(match value {
        Value::String(text) => Value::String(crate::render_body(&text, vars, mode)?),
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| render_value(&format!("{path}[{i}]"), item, vars, mode, depth + 1))
                .collect::<Result<_>>()?,
        ),
        Value::Mapping(entries) => Value::Mapping(
            entries
                .into_iter()
                .map(|(key, item)| {
                    let rendered =
                        render_value(&format!("{path}.{key}"), item, vars, mode, depth + 1)?;
                    Ok((key, rendered))
                })
                .collect::<Result<_>>()?,
        ),
        // Numbers, booleans, null and callables pass through unchanged.
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn no_injectable() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn merge_precedence_later_layers_win() {
        let builtins = from_json(json!({"x": 1}));
        let extra = from_json(json!({"x": 2, "y": 3}));
        let file = from_json(json!({"x": 4}));
        let resolved = resolve(
            &builtins,
            &extra,
            &file,
            None,
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap();
        assert_eq!(resolved["x"], Value::from(4));
        assert_eq!(resolved["y"], Value::from(3));
    }

    #[test]
    fn file_context_from_reroots_the_file_layer() {
        let file = from_json(json!({
            "prod": {"table": "orders"},
            "dev": {"table": "orders_dev"}
        }));
        let resolved = resolve(
            &Context::new(),
            &Context::new(),
            &file,
            Some("prod"),
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap();
        assert_eq!(resolved["table"], Value::from("orders"));
        // The sibling section is discarded along with the wrapper keys.
        assert!(!resolved.contains_key("dev"));
        assert!(!resolved.contains_key("prod"));
    }

    #[test]
    fn file_context_from_missing_key_keeps_the_layer_as_given() {
        let file = from_json(json!({"table": "orders"}));
        let resolved = resolve(
            &Context::new(),
            &Context::new(),
            &file,
            Some("absent"),
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap();
        assert_eq!(resolved["table"], Value::from("orders"));
    }

    #[test]
    fn context_values_reference_each_other() {
        let extra = from_json(json!({
            "table": "orders",
            "query": "SELECT * FROM {{ table }}"
        }));
        let resolved = resolve(
            &Context::new(),
            &extra,
            &Context::new(),
            None,
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap();
        assert_eq!(resolved["query"], Value::from("SELECT * FROM orders"));
    }

    #[test]
    fn self_reference_resolves_one_level_deep() {
        // `a` sees the unresolved form of `b`; the leftover marker stays.
        let extra = from_json(json!({
            "a": "{{ b }}",
            "b": "{{ missing }}"
        }));
        let resolved = resolve(
            &Context::new(),
            &extra,
            &Context::new(),
            None,
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap();
        assert_eq!(resolved["a"], Value::from("{{ missing }}"));
        assert_eq!(resolved["b"], Value::from("{{ missing }}"));
    }

    #[test]
    fn nested_values_are_rendered_in_place() {
        let extra = from_json(json!({
            "schema": "public",
            "config": {"target": "{{ schema }}.orders", "limit": 10},
            "names": ["{{ schema }}", 7]
        }));
        let resolved = resolve(
            &Context::new(),
            &extra,
            &Context::new(),
            None,
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap();
        let config = resolved["config"].as_mapping().unwrap();
        assert_eq!(config["target"], Value::from("public.orders"));
        assert_eq!(config["limit"], Value::from(10));
        assert_eq!(
            resolved["names"],
            Value::Sequence(vec![Value::from("public"), Value::from(7)])
        );
    }

    #[test]
    fn deep_nesting_hits_the_recursion_limit() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!({ "inner": value });
        }
        let extra = from_json(json!({ "deep": value }));
        let err = resolve(
            &Context::new(),
            &extra,
            &Context::new(),
            None,
            &no_injectable(),
            RenderMode::Expression,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::RecursionLimit { .. }));
    }
}
