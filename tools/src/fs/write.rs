//! writeFile: create or overwrite a file

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use super::{display_path, resolve_param, str_param};
use crate::types::{ParamSpec, ParamType, Params, ToolDefinition};

pub fn definition() -> ToolDefinition {
    ToolDefinition::new("writeFile", "Write content to a file, creating parent directories")
        .param(ParamSpec::required("path", ParamType::String, "File to write"))
        .param(ParamSpec::required("content", ParamType::String, "Full new file content"))
        .modifies_files()
}

/// Output JSON: `{ "path", "bytesWritten", "created" }`
pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let path = resolve_param(params, "path", "writeFile", root)?;
    let content = str_param(params, "content", "writeFile")?;

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).with_context(|| {
                format!("writeFile: cannot create parent dirs for {}", path.display())
            })?;
        }
    }

    let created = !path.exists();
    fs::write(&path, content.as_bytes())
        .with_context(|| format!("writeFile: failed to write {}", path.display()))?;

    Ok(json!({
        "path": display_path(&path, root),
        "bytesWritten": content.len() as u64,
        "created": created,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let params = json!({"path": "src/deep/new.rs", "content": "fn x() {}"})
            .as_object()
            .cloned()
            .unwrap();
        let out = execute(&params, dir.path()).unwrap();
        assert_eq!(out["created"], true);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/deep/new.rs")).unwrap(),
            "fn x() {}"
        );
    }
}
