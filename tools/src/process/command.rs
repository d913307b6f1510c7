//! runCommand: run a shell command with timeout and cancellation

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::types::{CallContext, ParamSpec, ParamType, Params, Tool, ToolDefinition, ToolResult};

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_OUTPUT_CHARS: usize = 20_000;

pub struct RunCommand {
    def: ToolDefinition,
}

impl RunCommand {
    pub fn new() -> Self {
        Self {
            def: ToolDefinition::new("runCommand", "Run a shell command in the workspace and capture its output")
                .param(ParamSpec::required("command", ParamType::String, "Command line passed to sh -c"))
                .param(ParamSpec::optional("cwd", ParamType::String, "Working directory relative to the workspace"))
                .param(ParamSpec::optional("timeoutMs", ParamType::Integer, "Kill the command after this long")),
        }
    }
}

impl Default for RunCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep the tail of long output; errors usually land at the end
fn clip(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let count = text.chars().count();
    if count <= MAX_OUTPUT_CHARS {
        return text.into_owned();
    }
    let tail: String = text.chars().skip(count - MAX_OUTPUT_CHARS).collect();
    format!("[... {} chars omitted ...]\n{tail}", count - MAX_OUTPUT_CHARS)
}

#[async_trait]
impl Tool for RunCommand {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, params: Params, ctx: CallContext) -> ToolResult {
        let Some(command) = params.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::err("runCommand: missing required field 'command'");
        };
        let cwd = match params.get("cwd").and_then(|v| v.as_str()) {
            Some(dir) => ctx.resolve(dir),
            None => ctx.workspace_root.clone(),
        };
        let timeout = Duration::from_millis(
            params
                .get("timeoutMs")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        );

        info!(run_id = %ctx.run_id, "runCommand: {command}");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("runCommand: failed to spawn: {e}")),
        };

        // Dropping the output future kills the child
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                warn!("runCommand cancelled: {command}");
                return ToolResult::cancelled("runCommand");
            }
            _ = tokio::time::sleep(timeout) => {
                return ToolResult::err(format!(
                    "runCommand: timed out after {}ms: {command}",
                    timeout.as_millis()
                ));
            }
            out = child.wait_with_output() => out,
        };

        let output = match output {
            Ok(o) => o,
            Err(e) => return ToolResult::err(format!("runCommand: {e}")),
        };
        let stdout = clip(&output.stdout);
        let stderr = clip(&output.stderr);
        let code = output.status.code();

        if output.status.success() {
            ToolResult::ok(json!({ "exitCode": code, "stdout": stdout, "stderr": stderr }))
        } else {
            let mut result = ToolResult::err(format!(
                "runCommand: exited with {}\n{}",
                code.map_or("signal".to_string(), |c| c.to_string()),
                if stderr.trim().is_empty() { &stdout } else { &stderr }
            ));
            result.data = Some(json!({ "exitCode": code, "stdout": stdout, "stderr": stderr }));
            result
        }
    }
}
