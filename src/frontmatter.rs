//! Frontmatter codec for work items and terminal documents.
//!
//! A document is a `---` delimiter line, `key: value` metadata lines, a
//! closing `---` line, then a free-form markdown body. Blank lines and
//! lines starting with `#` inside the header are ignored.
//!
//! Scalars are coerced on parse:
//! - `true` / `false` (any case) become booleans
//! - `null` / `none` (any case) become null
//! - `"..."` / `'...'` are strings, kept verbatim (leading zeros survive)
//! - a run of ASCII digits becomes an integer
//! - anything else is a bare string
//!
//! Rendering sorts keys and quotes any string that would not re-parse as
//! itself, so `parse(render(meta, body))` gives back the same metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DELIMITER: &str = "---";

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        i64::try_from(n).map_or_else(|_| Value::Str(n.to_string()), Value::Int)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Ordered metadata map. Rendering order is the key order.
pub type Meta = BTreeMap<String, Value>;

/// Parse one scalar according to the coercion rules above.
pub fn parse_scalar(raw: &str) -> Value {
    let raw = raw.trim();
    let lowered = raw.to_ascii_lowercase();
    match lowered.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }

    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        // Rendered strings are JSON-escaped; hand-written ones may not be.
        return match serde_json::from_str::<String>(raw) {
            Ok(s) => Value::Str(s),
            Err(_) => Value::Str(raw[1..raw.len() - 1].to_string()),
        };
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::Str(raw[1..raw.len() - 1].to_string());
    }

    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::Int(n);
        }
    }

    Value::Str(raw.to_string())
}

/// Split a document into metadata and body.
///
/// The body is normalized to its trimmed text plus one trailing newline.
pub fn parse(text: &str) -> Result<(Meta, String)> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.first().map(|l| l.trim()) != Some(DELIMITER) {
        return Err(Error::Frontmatter {
            line: 1,
            message: "missing frontmatter start".to_string(),
        });
    }

    let end = lines
        .iter()
        .skip(1)
        .position(|l| l.trim() == DELIMITER)
        .map(|i| i + 1)
        .ok_or_else(|| Error::Frontmatter {
            line: lines.len(),
            message: "missing frontmatter end".to_string(),
        })?;

    let mut meta = Meta::new();
    for (i, line) in lines[1..end].iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::Frontmatter {
                line: i + 2,
                message: format!("invalid frontmatter line: {line}"),
            });
        };
        meta.insert(key.trim().to_string(), parse_scalar(value));
    }

    let body = lines[end + 1..].join("\n");
    Ok((meta, format!("{}\n", body.trim())))
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.contains(':')
        || s.contains('#')
        || s.contains('\n')
        || s.trim() != s
        || s.starts_with('"')
        || s.starts_with('\'')
        || s.bytes().all(|b| b.is_ascii_digit())
        || parse_scalar(s) != Value::Str(s.to_string())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Str(s) if needs_quotes(s) => {
            serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
        }
        Value::Str(s) => s.clone(),
    }
}

/// Render the `---` delimited header block.
pub fn render_header(meta: &Meta) -> String {
    let mut out = String::from(DELIMITER);
    out.push('\n');
    for (key, value) in meta {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&render_value(value));
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out
}

/// Render a full document: header, blank line, body.
pub fn render(meta: &Meta, body: &str) -> String {
    format!("{}\n{}\n", render_header(meta), body.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_coercion() {
        assert_eq!(parse_scalar(" TRUE "), Value::Bool(true));
        assert_eq!(parse_scalar("None"), Value::Null);
        assert_eq!(parse_scalar("240"), Value::Int(240));
        assert_eq!(parse_scalar("\"0003\""), Value::Str("0003".into()));
        assert_eq!(parse_scalar("'a: b'"), Value::Str("a: b".into()));
        assert_eq!(parse_scalar("-5"), Value::Str("-5".into()));
        assert_eq!(parse_scalar("@dev"), Value::Str("@dev".into()));
    }

    #[test]
    fn strings_that_look_typed_are_quoted() {
        assert_eq!(render_value(&Value::Str("0003".into())), "\"0003\"");
        assert_eq!(render_value(&Value::Str("true".into())), "\"true\"");
        assert_eq!(render_value(&Value::Str("null".into())), "\"null\"");
        assert_eq!(render_value(&Value::Str("".into())), "\"\"");
        assert_eq!(render_value(&Value::Str("high".into())), "high");
    }

    #[test]
    fn huge_digit_runs_stay_strings() {
        let raw = "99999999999999999999999";
        assert_eq!(parse_scalar(raw), Value::Str(raw.into()));
        assert_eq!(render_value(&Value::Str(raw.into())), format!("\"{raw}\""));
    }
}
