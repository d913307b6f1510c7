//! Parameter-name normalization and lenient type coercion
//!
//! Models routinely call `readFile` with `file` or `filePath` instead of `path`.
//! Synonyms are rewritten only when the tool declares the canonical name, does not
//! itself declare the synonym, and the canonical key is not already present.

use serde_json::Value;
use tracing::debug;

use crate::types::{ParamType, Params, ToolDefinition};

/// (synonym, canonical)
const SYNONYMS: &[(&str, &str)] = &[
    ("file", "path"),
    ("filePath", "path"),
    ("file_path", "path"),
    ("filename", "path"),
    ("filepath", "path"),
    ("dir", "path"),
    ("directory", "path"),
    ("cmd", "command"),
    ("text", "content"),
    ("contents", "content"),
    ("body", "content"),
    ("pattern", "query"),
    ("term", "query"),
    ("start_line", "startLine"),
    ("end_line", "endLine"),
    ("lineNumber", "line"),
    ("line_number", "line"),
    ("max_results", "maxResults"),
    ("timeout_ms", "timeoutMs"),
];

/// Search/replace pairs only make sense on the in-place edit tool
const REPLACE_SYNONYMS: &[(&str, &str)] = &[
    ("old", "search"),
    ("oldText", "search"),
    ("old_text", "search"),
    ("find", "search"),
    ("target", "search"),
    ("new", "replace"),
    ("newText", "replace"),
    ("new_text", "replace"),
    ("replacement", "replace"),
];

fn synonyms_for(tool: &str) -> impl Iterator<Item = &'static (&'static str, &'static str)> {
    let replace: &'static [(&str, &str)] = if tool == "replaceInFile" {
        REPLACE_SYNONYMS
    } else {
        &[]
    };
    SYNONYMS.iter().chain(replace.iter())
}

/// Rewrite synonym keys to the names the tool declares
pub fn normalize_params(def: &ToolDefinition, mut params: Params) -> Params {
    for (synonym, canonical) in synonyms_for(&def.name) {
        if !def.declares(canonical) || def.declares(synonym) || params.contains_key(*canonical) {
            continue;
        }
        if let Some(value) = params.remove(*synonym) {
            debug!(tool = %def.name, "normalized param {synonym} -> {canonical}");
            params.insert((*canonical).to_string(), value);
        }
    }
    params
}

/// Coerce stringly-typed primitives into their declared types before validation
pub fn coerce_params(def: &ToolDefinition, params: &mut Params) {
    for spec in &def.params {
        let Some(value) = params.get_mut(&spec.name) else {
            continue;
        };
        let Value::String(s) = value else {
            continue;
        };
        let trimmed = s.trim();
        let coerced = match spec.kind {
            ParamType::Integer => trimmed.parse::<i64>().ok().map(Value::from),
            ParamType::Number => trimmed.parse::<f64>().ok().map(Value::from),
            ParamType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        };
        if let Some(v) = coerced {
            *value = v;
        }
    }
}
