//! replaceInFile: fuzzy search-and-replace of one block

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::debug;

use super::{display_path, resolve_param, str_param};
use crate::fuzzy::{fuzzy_find, DEFAULT_THRESHOLD};
use crate::types::{ParamSpec, ParamType, Params, ToolDefinition};

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        "replaceInFile",
        "Replace one block of text in a file; tolerates whitespace drift and small typos in the search block",
    )
    .param(ParamSpec::required("path", ParamType::String, "File to edit"))
    .param(ParamSpec::required("search", ParamType::String, "Existing text to replace"))
    .param(ParamSpec::required("replace", ParamType::String, "Replacement text"))
    .modifies_files()
}

/// Output JSON: `{ "path", "strategy", "distance", "line" }`. The file is untouched on failure.
pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let path = resolve_param(params, "path", "replaceInFile", root)?;
    let search = str_param(params, "search", "replaceInFile")?;
    let replacement = str_param(params, "replace", "replaceInFile")?;

    let content = fs::read_to_string(&path)
        .with_context(|| format!("replaceInFile: failed to read {}", path.display()))?;

    let Some(m) = fuzzy_find(&content, search, DEFAULT_THRESHOLD) else {
        anyhow::bail!(
            "replaceInFile: search block not found in {} (no exact, whitespace-normalized or close match)",
            display_path(&path, root)
        );
    };
    debug!(strategy = ?m.strategy, distance = m.distance, "replaceInFile matched");

    let line = content[..m.start].matches('\n').count() + 1;
    let mut updated = String::with_capacity(content.len() + replacement.len());
    updated.push_str(&content[..m.start]);
    updated.push_str(replacement);
    updated.push_str(&content[m.end..]);

    fs::write(&path, updated)
        .with_context(|| format!("replaceInFile: failed to write {}", path.display()))?;

    Ok(json!({
        "path": display_path(&path, root),
        "strategy": m.strategy,
        "distance": m.distance,
        "line": line,
    }))
}
