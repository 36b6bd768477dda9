use std::fs;
use std::path::Path;

use tracing::debug;

use crate::context::{Context, Value};
use crate::errors::{RenderError, Result};

/// A template file split into its body and frontmatter context.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub body: String,
    pub frontmatter: Context,
}

/// File-parsing collaborator. The engine consumes `body` as the template
/// text and `frontmatter` as the file-sourced context layer.
pub trait Loader: Send + Sync {
    /// Extensions (without the dot) this loader accepts; `Runner::render`
    /// treats an input ending in one of these as a path.
    fn accepted_extensions(&self) -> &[&str];

    fn parse(&self, path: &Path) -> Result<ParsedFile>;
}

/// Default loader: `.sql` files with an optional leading `---`-delimited
/// YAML frontmatter block, and `.yml`/`.yaml` files whose `sql` key holds
/// the body with the remaining keys as frontmatter.
#[derive(Debug, Default, Clone)]
pub struct FrontmatterLoader;

impl Loader for FrontmatterLoader {
    fn accepted_extensions(&self) -> &[&str] {
        &["sql", "yml", "yaml"]
    }

    fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let raw = fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        debug!(path = %path.display(), ext, "parsing template file");
        match ext {
            "yml" | "yaml" => parse_yaml_file(&raw),
            _ => parse_frontmatter(&raw),
        }
    }
}

/// Split a `.sql` file into frontmatter and body. Files without a leading
/// `---` line are all body.
pub fn parse_frontmatter(raw: &str) -> Result<ParsedFile> {
    let Some(rest) = raw
        .strip_prefix("---")
        .and_then(|r| r.strip_prefix("\r\n").or_else(|| r.strip_prefix('\n')))
    else {
        return Ok(ParsedFile {
            body: raw.to_string(),
            frontmatter: Context::new(),
        });
    };
    // An immediately-closing marker means an empty frontmatter block.
    let (header, after) = if let Some(after) = rest.strip_prefix("---") {
        ("", after)
    } else {
        let Some(end) = rest.find("\n---") else {
            return Err(RenderError::Loader(
                "unterminated frontmatter block".to_string(),
            ));
        };
        (&rest[..end], &rest[end + "\n---".len()..])
    };
    let body = after
        .strip_prefix("\r\n")
        .or_else(|| after.strip_prefix('\n'))
        .unwrap_or(after)
        .to_string();
    Ok(ParsedFile {
        body,
        frontmatter: parse_yaml_mapping(header)?,
    })
}

/// Parse a whole-file YAML template: the `sql` key is the body.
pub fn parse_yaml_file(raw: &str) -> Result<ParsedFile> {
    let mut frontmatter = parse_yaml_mapping(raw)?;
    let body = match frontmatter.remove("sql") {
        Some(Value::String(s)) => s,
        _ => {
            return Err(RenderError::Loader(
                "missing string-valued `sql` key".to_string(),
            ))
        }
    };
    Ok(ParsedFile { body, frontmatter })
}

fn parse_yaml_mapping(raw: &str) -> Result<Context> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| RenderError::Loader(e.to_string()))?;
    match yaml_to_value(doc) {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Context::new()),
        _ => Err(RenderError::Loader(
            "expected a mapping at the top level".to_string(),
        )),
    }
}

fn yaml_to_value(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => yaml_number(&n),
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(yaml_to_value).collect())
        }
        serde_yaml::Value::Mapping(entries) => Value::Mapping(
            entries
                .into_iter()
                .filter_map(|(key, item)| Some((yaml_key(key)?, yaml_to_value(item))))
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(tagged.value),
    }
}

fn yaml_key(key: serde_yaml::Value) -> Option<String> {
    match key {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_number(n: &serde_yaml::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Number(i.into())
    } else if let Some(u) = n.as_u64() {
        Value::Number(u.into())
    } else {
        n.as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
