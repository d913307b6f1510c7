//! listDirectory: list a directory, optionally recursively

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use super::display_path;
use crate::types::{resolve_in, ParamSpec, ParamType, Params, ToolDefinition};

const MAX_ENTRIES: usize = 1000;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target"];

pub fn definition() -> ToolDefinition {
    ToolDefinition::new("listDirectory", "List files and directories under a path")
        .param(ParamSpec::optional("path", ParamType::String, "Directory (default: workspace root)"))
        .param(ParamSpec::optional("recursive", ParamType::Boolean, "Descend into subdirectories"))
        .read_only()
}

/// Output JSON: `{ "path", "entries": [{ "path", "type", "size" }], "truncated" }`
pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let rel = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let dir = resolve_in(root, rel);
    let recursive = params.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);

    if !dir.is_dir() {
        anyhow::bail!("listDirectory: not a directory: {}", dir.display());
    }

    let mut entries = Vec::new();
    let mut truncated = false;

    let walker = WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("listDirectory: error walking {}", dir.display()))?;
        if entries.len() >= MAX_ENTRIES {
            truncated = true;
            break;
        }
        let ft = entry.file_type();
        let kind = if ft.is_symlink() {
            "symlink"
        } else if ft.is_dir() {
            "dir"
        } else {
            "file"
        };
        let size = fs::symlink_metadata(entry.path()).map(|m| m.len()).unwrap_or(0);
        entries.push(json!({
            "path": display_path(entry.path(), root),
            "type": kind,
            "size": size,
        }));
    }

    Ok(json!({
        "path": display_path(&dir, root),
        "entries": entries,
        "truncated": truncated,
    }))
}
