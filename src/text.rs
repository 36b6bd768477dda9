use std::collections::BTreeMap;

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::context::{Context, Value, MAX_DEPTH};
use crate::errors::{RenderError, Result};

static OPEN_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*").expect("literal pattern"));
static CLOSE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\}\}").expect("literal pattern"));

/// Canonicalize spacing inside `{{ }}` markers so exactly one space
/// separates each marker from the enclosed name. Idempotent.
pub fn clean_spacing(text: &str) -> String {
    let text = OPEN_MARKER.replace_all(text, "{{ ");
    CLOSE_MARKER.replace_all(&text, " }}").into_owned()
}

/// Flatten nested mappings into dotted-path keys, depth-first:
/// `{a: {b: {c: "x"}}}` becomes `{"a.b.c": "x"}`. Sequences and every other
/// non-mapping value are leaves. The input is never mutated.
pub fn flatten(context: &Context) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    flatten_into(context, "", 0, &mut out)?;
    Ok(out)
}

fn flatten_into(
    mapping: &Context,
    parent: &str,
    depth: usize,
    out: &mut BTreeMap<String, Value>,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(RenderError::RecursionLimit {
            key: parent.to_string(),
        });
    }
    for (key, value) in mapping {
        let path = if parent.is_empty() {
            key.clone()
        } else {
            format!("{parent}.{key}")
        };
        match value {
            Value::Mapping(nested) => flatten_into(nested, &path, depth + 1, out)?,
            other => {
                out.insert(path, other.clone());
            }
        }
    }
    Ok(())
}

/// Render by exact token substitution.
///
/// The text is spacing-canonicalized, the context flattened, and every
/// `{{key}}` / `{{ key }}` occurrence replaced with the stringified value.
/// Replacement proceeds longest key first (ties broken lexicographically),
/// so a key that is a prefix of another never partially clobbers the longer
/// token. Values are stringified only when their token actually occurs, so
/// callables in the context are harmless until a template references one.
pub fn render_literal(text: &str, vars: &Context) -> Result<String> {
    let mut text = clean_spacing(text);
    let flat = flatten(vars)?;
    let mut replaced = 0usize;
    for key in flat
        .keys()
        .sorted_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)))
    {
        let spaced = format!("{{{{ {key} }}}}");
        let plain = format!("{{{{{key}}}}}");
        if !text.contains(&spaced) && !text.contains(&plain) {
            continue;
        }
        let replacement = stringify(key, &flat[key])?;
        text = text.replace(&spaced, &replacement);
        text = text.replace(&plain, &replacement);
        replaced += 1;
    }
    trace!(replaced, "literal replacement pass done");
    Ok(dedent(&text))
}

/// Textual form of a value for literal substitution.
fn stringify(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
        Value::Sequence(_) | Value::Mapping(_) => {
            serde_json::to_string(value).map_err(|_| RenderError::Stringify {
                key: key.to_string(),
            })
        }
        Value::Callable(_) => Err(RenderError::Stringify {
            key: key.to_string(),
        }),
    }
}

/// Doc-style dedent: drops surrounding blank lines and the common
/// indentation margin, the way embedded multi-line template bodies are
/// authored with indentation for readability. The first line's own
/// indentation is removed entirely.
pub fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let margin = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.chars().take_while(|c| c.is_whitespace()).count())
        .min()
        .unwrap_or(0);
    let mut out: Vec<&str> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                line.trim_start()
            } else {
                strip_margin(line, margin)
            }
        })
        .collect();
    while out.first().is_some_and(|line| line.trim().is_empty()) {
        out.remove(0);
    }
    while out.last().is_some_and(|line| line.trim().is_empty()) {
        out.pop();
    }
    out.join("\n")
}

// Skip at most `margin` leading whitespace characters.
fn strip_margin(line: &str, margin: usize) -> &str {
    let mut skipped = 0;
    for (idx, c) in line.char_indices() {
        if skipped == margin || !c.is_whitespace() {
            return &line[idx..];
        }
        skipped += 1;
    }
    ""
}
