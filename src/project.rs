use serde_json::{Map, Value};
use thiserror::Error;

/// A parsed field expression: a set of dot-separated paths, e.g.
/// `title,year,authors.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldExpr {
    paths: Vec<Vec<String>>,
}

#[derive(Debug, Error)]
#[error("bad field expression: {0}")]
pub struct BadFieldExpr(String);

impl FieldExpr {
    /// Parse a comma-separated list of dotted paths. An empty or missing
    /// expression yields the default projection.
    pub fn parse(expr: Option<&str>) -> Result<Self, BadFieldExpr> {
        let expr = match expr {
            Some(e) if !e.trim().is_empty() => e,
            _ => return Ok(Self::default_paper()),
        };
        let mut paths = Vec::new();
        for part in expr.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(BadFieldExpr(format!("empty path in `{}`", expr)));
            }
            let segments: Vec<String> = part.split('.').map(|s| s.trim().to_string()).collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(BadFieldExpr(format!("empty segment in `{}`", part)));
            }
            paths.push(segments);
        }
        Ok(Self { paths })
    }

    /// The default projection for papers: `paperId,title`.
    pub fn default_paper() -> Self {
        Self {
            paths: vec![vec!["paperId".to_string()], vec!["title".to_string()]],
        }
    }

    /// The raw expression forwarded to the upstream API.
    pub fn to_expr_string(&self) -> String {
        self.paths
            .iter()
            .map(|p| p.join("."))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Keys that identify an element inside an array and are always retained
/// when the element is an object.
const IDENTITY_KEYS: [&str; 2] = ["paperId", "authorId"];

/// Project a full paper record down to the requested fields. `paperId` is
/// always present in the output when the source record carries one.
pub fn project_paper(record: &Value, expr: &FieldExpr) -> Value {
    let mut out = match project_value(record, &as_slices(&expr.paths)) {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    if !out.contains_key("paperId") {
        if let Some(id) = record.get("paperId") {
            if !id.is_null() {
                out.insert("paperId".to_string(), id.clone());
            }
        }
    }
    Value::Object(out)
}

/// Project a relation or search item. Same semantics as [`project_paper`];
/// edge attributes requested through the expression are passed through.
pub fn project_item(record: &Value, expr: &FieldExpr) -> Value {
    project_paper(record, expr)
}

fn as_slices(paths: &[Vec<String>]) -> Vec<&[String]> {
    paths.iter().map(|p| p.as_slice()).collect()
}

/// Recursive projection. Returns `None` when nothing under `value` matches,
/// so missing source fields produce absent output keys.
fn project_value(value: &Value, paths: &[&[String]]) -> Option<Value> {
    match value {
        Value::Object(map) => project_object(map, paths),
        Value::Array(items) => project_array(items, paths),
        // A scalar can only be selected whole; any remaining path segments
        // cannot descend into it.
        _ if paths.iter().any(|p| p.is_empty()) => Some(value.clone()),
        _ => None,
    }
}

fn project_object(map: &Map<String, Value>, paths: &[&[String]]) -> Option<Value> {
    // A fully consumed path selects the whole subtree.
    if paths.iter().any(|p| p.is_empty()) {
        return Some(Value::Object(map.clone()));
    }
    let mut out = Map::new();
    for (key, value) in map {
        let tails: Vec<&[String]> = paths
            .iter()
            .filter(|p| p.first().map(|s| s == key).unwrap_or(false))
            .map(|p| &p[1..])
            .collect();
        if tails.is_empty() {
            continue;
        }
        if value.is_null() {
            // Absent upstream fields are omitted, not emitted as null.
            continue;
        }
        if let Some(projected) = project_value(value, &tails) {
            out.insert(key.clone(), projected);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

fn project_array(items: &[Value], paths: &[&[String]]) -> Option<Value> {
    if paths.iter().any(|p| p.is_empty()) {
        return Some(Value::Array(items.to_vec()));
    }
    let projected: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut out = match project_value(item, paths) {
                Some(Value::Object(m)) => m,
                Some(other) => return other,
                None => Map::new(),
            };
            if let Value::Object(src) = item {
                for key in IDENTITY_KEYS {
                    if let Some(id) = src.get(key) {
                        if !id.is_null() && !out.contains_key(key) {
                            out.insert(key.to_string(), id.clone());
                        }
                    }
                }
            }
            Value::Object(out)
        })
        .collect();
    Some(Value::Array(projected))
}
