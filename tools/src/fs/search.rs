//! searchFiles: case-insensitive text search across workspace files

use anyhow::Result;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use super::{display_path, str_param};
use crate::types::{resolve_in, ParamSpec, ParamType, Params, ToolDefinition};

const DEFAULT_MAX_RESULTS: usize = 50;
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", "build"];

pub fn definition() -> ToolDefinition {
    ToolDefinition::new("searchFiles", "Search file contents for a text query (case-insensitive)")
        .param(ParamSpec::required("query", ParamType::String, "Text to look for"))
        .param(ParamSpec::optional("path", ParamType::String, "Directory to search (default: workspace root)"))
        .param(ParamSpec::optional("maxResults", ParamType::Integer, "Maximum matches to return"))
        .read_only()
}

/// Output JSON: `{ "query", "matches": [{ "path", "line", "text" }], "truncated" }`
pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let query = str_param(params, "query", "searchFiles")?;
    if query.trim().is_empty() {
        anyhow::bail!("searchFiles: query is empty");
    }
    let needle = query.to_lowercase();
    let rel = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let base = resolve_in(root, rel);
    let max = params
        .get("maxResults")
        .and_then(|v| v.as_u64())
        .map(|m| m as usize)
        .unwrap_or(DEFAULT_MAX_RESULTS)
        .max(1);

    let mut matches = Vec::new();
    let mut truncated = false;

    let walker = WalkDir::new(&base)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    'files: for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // Binary or non-UTF-8 files are skipped
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if line.to_lowercase().contains(&needle) {
                if matches.len() >= max {
                    truncated = true;
                    break 'files;
                }
                matches.push(json!({
                    "path": display_path(entry.path(), root),
                    "line": idx + 1,
                    "text": line.trim(),
                }));
            }
        }
    }

    Ok(json!({ "query": query, "matches": matches, "truncated": truncated }))
}
