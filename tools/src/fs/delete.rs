//! deleteFile: remove a single file

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use super::{display_path, resolve_param};
use crate::types::{ParamSpec, ParamType, Params, ToolDefinition};

pub fn definition() -> ToolDefinition {
    ToolDefinition::new("deleteFile", "Delete a file (directories are refused)")
        .param(ParamSpec::required("path", ParamType::String, "File to delete"))
        .modifies_files()
}

pub fn execute(params: &Params, root: &Path) -> Result<Value> {
    let path = resolve_param(params, "path", "deleteFile", root)?;

    if !path.exists() {
        anyhow::bail!("deleteFile: path does not exist: {}", path.display());
    }
    if path.is_dir() {
        anyhow::bail!("deleteFile: {} is a directory", path.display());
    }

    fs::remove_file(&path)
        .with_context(|| format!("deleteFile: failed to remove {}", path.display()))?;

    Ok(json!({ "path": display_path(&path, root), "deleted": true }))
}
