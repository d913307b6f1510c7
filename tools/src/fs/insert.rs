//! insertText: insert lines before a given 1-based line

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use super::{display_path, resolve_param, str_param};
use crate::types::{ParamSpec, ParamType, Params, ToolDefinition};

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        "insertText",
        "Insert text before a 1-based line; line = total + 1 appends",
    )
    .param(ParamSpec::required("path", ParamType::String, "File to edit"))
    .param(ParamSpec::required("line", ParamType::Integer, "Line to insert before"))
    .param(ParamSpec::required("content", ParamType::String, "Text to insert"))
    .modifies_files()
}

pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let path = resolve_param(params, "path", "insertText", root)?;
    let text = str_param(params, "content", "insertText")?;
    let line = params
        .get("line")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow::anyhow!("insertText: 'line' must be a positive integer"))?
        as usize;

    let original = fs::read_to_string(&path)
        .with_context(|| format!("insertText: failed to read {}", path.display()))?;
    let mut lines: Vec<&str> = original.lines().collect();
    if line == 0 || line > lines.len() + 1 {
        anyhow::bail!(
            "insertText: line {line} out of range (file has {} lines)",
            lines.len()
        );
    }

    let inserted: Vec<&str> = text.lines().collect();
    let count = inserted.len();
    lines.splice(line - 1..line - 1, inserted);

    let mut updated = lines.join("\n");
    if original.ends_with('\n') || original.is_empty() {
        updated.push('\n');
    }
    fs::write(&path, updated)
        .with_context(|| format!("insertText: failed to write {}", path.display()))?;

    Ok(json!({
        "path": display_path(&path, root),
        "line": line,
        "linesInserted": count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_insert_middle_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "a\nc\n").unwrap();

        execute(&params(json!({"path": "a.txt", "line": 2, "content": "b"})), dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a\nb\nc\n");

        execute(&params(json!({"path": "a.txt", "line": 4, "content": "d"})), dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a\nb\nc\nd\n");
    }

    #[test]
    fn test_insert_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        assert!(execute(&params(json!({"path": "a.txt", "line": 5, "content": "x"})), dir.path()).is_err());
    }
}
