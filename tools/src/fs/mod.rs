//! Workspace filesystem tools: read, write, list, search, delete, insert, replace.
//!
//! Each submodule exposes `definition()` and a synchronous
//! `execute(params, root) -> Result<Value>`; [`FsTool`] runs it on the blocking pool
//! and turns errors into failed results.

pub mod delete;
pub mod insert;
pub mod list;
pub mod read;
pub mod replace;
pub mod search;
pub mod write;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::ToolRegistry;
use crate::types::{resolve_in, CallContext, Params, Tool, ToolDefinition, ToolResult};

type Handler = fn(&Params, &Path) -> Result<Value>;

/// Adapter from a synchronous filesystem handler to the async tool contract
pub struct FsTool {
    def: ToolDefinition,
    handler: Handler,
}

impl FsTool {
    pub fn new(def: ToolDefinition, handler: Handler) -> Self {
        Self { def, handler }
    }
}

#[async_trait]
impl Tool for FsTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, params: Params, ctx: CallContext) -> ToolResult {
        let handler = self.handler;
        let root = ctx.workspace_root.clone();
        match tokio::task::spawn_blocking(move || handler(&params, &root)).await {
            Ok(Ok(data)) => ToolResult::ok(data),
            Ok(Err(e)) => ToolResult::err(format!("{e:#}")),
            Err(e) => ToolResult::err(format!("{}: {e}", self.def.name)),
        }
    }
}

/// Register every filesystem tool with the registry
pub fn register_all(reg: &mut ToolRegistry) {
    reg.register(Arc::new(FsTool::new(read::definition(), read::execute)));
    reg.register(Arc::new(FsTool::new(list::definition(), list::execute)));
    reg.register(Arc::new(FsTool::new(search::definition(), search::execute)));
    reg.register(Arc::new(FsTool::new(write::definition(), write::execute)));
    reg.register(Arc::new(FsTool::new(insert::definition(), insert::execute)));
    reg.register(Arc::new(FsTool::new(replace::definition(), replace::execute)));
    reg.register(Arc::new(FsTool::new(delete::definition(), delete::execute)));
}

pub(crate) fn str_param<'a>(params: &'a Params, key: &str, tool: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("{tool}: missing required field '{key}'"))
}

pub(crate) fn resolve_param(params: &Params, key: &str, tool: &str, root: &Path) -> Result<PathBuf> {
    Ok(resolve_in(root, str_param(params, key, tool)?))
}

/// Path relative to the workspace root when possible, for tool output
pub(crate) fn display_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}
