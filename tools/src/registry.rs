//! Tool Registry: stores tools by name and owns the permission gate

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::permission::{PermissionGate, PermissionMode};
use crate::types::{Tool, ToolDefinition};

/// Tools that change state outside the conversation. Never auto-approved.
pub const DESTRUCTIVE_TOOLS: &[&str] = &[
    "writeFile",
    "deleteFile",
    "replaceInFile",
    "insertText",
    "runCommand",
];

pub fn is_destructive_tool(name: &str) -> bool {
    DESTRUCTIVE_TOOLS.contains(&name)
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    gate: PermissionGate,
}

impl ToolRegistry {
    pub fn new(gate: PermissionGate) -> Self {
        Self {
            tools: HashMap::new(),
            gate,
        }
    }

    /// Registry preloaded with the built-in workspace tools
    pub fn with_builtin_tools(gate: PermissionGate) -> Self {
        let mut registry = Self::new(gate);
        crate::fs::register_all(&mut registry);
        crate::process::register_all(&mut registry);
        registry
    }

    /// Register a tool, replacing any previous tool of the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        info!("Registered tool: {name}");
        self.tools.insert(name, tool);
    }

    pub fn deregister(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| t.definition())
    }

    /// All definitions, sorted by name for stable prompts
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition().clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Closest registered names by case-insensitive substring match in either direction
    pub fn suggest(&self, name: &str) -> Vec<String> {
        let needle = name.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<String> = self
            .tools
            .keys()
            .filter(|k| {
                let k = k.to_lowercase();
                k.contains(&needle) || needle.contains(&k)
            })
            .cloned()
            .collect();
        hits.sort();
        hits
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.definition(name).is_some_and(|d| d.read_only)
    }

    /// Allowlisted destructive names, plus any registered tool that modifies files
    pub fn is_destructive(&self, name: &str) -> bool {
        is_destructive_tool(name) || self.definition(name).is_some_and(|d| d.modifies_files)
    }

    pub fn destructive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = DESTRUCTIVE_TOOLS.iter().map(|s| s.to_string()).collect();
        for def in self.tools.values().map(|t| t.definition()) {
            if def.modifies_files && !names.contains(&def.name) {
                names.push(def.name.clone());
            }
        }
        names
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut PermissionGate {
        &mut self.gate
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        self.gate.set_mode(mode);
    }

    /// Clear session-scoped permission grants
    pub fn reset_session(&self) {
        self.gate.reset_session();
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(PermissionGate::new(PermissionMode::default()))
    }
}
