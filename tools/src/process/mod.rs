//! Process tools: shell command execution inside the workspace

pub mod command;

use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Register every process tool with the registry
pub fn register_all(reg: &mut ToolRegistry) {
    reg.register(Arc::new(command::RunCommand::new()));
}
