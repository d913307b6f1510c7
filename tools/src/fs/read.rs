//! readFile: read a text file, optionally a line range

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use super::{display_path, resolve_param};
use crate::types::{ParamSpec, ParamType, Params, ToolDefinition};

pub fn definition() -> ToolDefinition {
    ToolDefinition::new("readFile", "Read a text file, optionally limited to a 1-based line range")
        .param(ParamSpec::required("path", ParamType::String, "File to read"))
        .param(ParamSpec::optional("startLine", ParamType::Integer, "First line (1-based)"))
        .param(ParamSpec::optional("endLine", ParamType::Integer, "Last line (inclusive)"))
        .read_only()
}

/// Output JSON: `{ "path", "content", "totalLines", "size" }`
pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let path = resolve_param(params, "path", "readFile", root)?;
    let content = fs::read_to_string(&path)
        .with_context(|| format!("readFile: failed to read {}", path.display()))?;

    let total = content.lines().count();
    let start = params.get("startLine").and_then(|v| v.as_u64());
    let end = params.get("endLine").and_then(|v| v.as_u64());

    let body = if start.is_some() || end.is_some() {
        let start = start.unwrap_or(1).max(1) as usize;
        let end = end.map(|e| e as usize).unwrap_or(total).min(total);
        if start > end {
            anyhow::bail!("readFile: empty line range {start}..{end} ({total} lines)");
        }
        content
            .lines()
            .skip(start - 1)
            .take(end + 1 - start)
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        content.clone()
    };

    Ok(json!({
        "path": display_path(&path, root),
        "content": body,
        "totalLines": total,
        "size": content.len() as u64,
    }))
}
