//! Core tool types shared by the registry, the permission gate and the loop

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Untyped parameter mapping as produced by the response parser
pub type Params = serde_json::Map<String, Value>;

/// A tool invocation parsed from model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// The `path` parameter, if the call carries one as a string
    pub fn path(&self) -> Option<&str> {
        self.params.get("path").and_then(|v| v.as_str())
    }
}

/// Outcome of one tool execution. Success or failure is the only branch the loop inspects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            cancelled: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            cancelled: false,
        }
    }

    pub fn cancelled(tool: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(format!("{tool} cancelled")),
            cancelled: true,
        }
    }

    /// Text form folded back into the conversation
    pub fn render(&self) -> String {
        if self.success {
            match &self.data {
                Some(Value::String(s)) => s.clone(),
                Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
                None => "ok".to_string(),
            }
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("unknown failure")
            )
        }
    }
}

/// Primitive parameter types a tool can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Declared shape of a tool: name, description, ordered parameters and side-effect flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// No side effects; auto-allowed in read-only mode and eligible for result caching
    pub read_only: bool,
    /// Successful calls change the file named by the `path` parameter
    pub modifies_files: bool,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            read_only: false,
            modifies_files: false,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn modifies_files(mut self) -> Self {
        self.modifies_files = true;
        self
    }

    pub fn declares(&self, param: &str) -> bool {
        self.params.iter().any(|p| p.name == param)
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.required)
    }

    /// One-line usage string for the system prompt
    pub fn usage(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let opt = if p.required { "" } else { "?" };
                format!("{}{opt}: {}", p.name, p.kind.as_str())
            })
            .collect();
        format!("{}({}) - {}", self.name, params.join(", "), self.description)
    }
}

/// Per-call context handed to every tool
#[derive(Debug, Clone)]
pub struct CallContext {
    pub workspace_root: PathBuf,
    pub cancel: CancellationToken,
    pub run_id: String,
    /// Skip the permission gate entirely
    pub trusted: bool,
}

impl CallContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cancel: CancellationToken::new(),
            run_id: String::new(),
            trusted: false,
        }
    }

    /// Resolve a tool-supplied path against the workspace root
    pub fn resolve(&self, path: &str) -> PathBuf {
        resolve_in(&self.workspace_root, path)
    }
}

pub(crate) fn resolve_in(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Dispatch failures. These never escape the registry; they become failed results.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool '{name}'.{hint}")]
    UnknownTool { name: String, hint: String },
    #[error("{tool}: missing required parameters: {}", missing.join(", "))]
    MissingParams { tool: String, missing: Vec<String> },
    #[error("{tool}: invalid parameters: {reason}")]
    InvalidParams { tool: String, reason: String },
    #[error("{0}: permission denied")]
    PermissionDenied(String),
    #[error("{tool}: execution failed: {message}")]
    Crashed { tool: String, message: String },
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::err(err.to_string())
    }
}

/// A named, schema-described operation
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    /// Run with already-validated parameters. Failures are reported in the result.
    async fn execute(&self, params: Params, ctx: CallContext) -> ToolResult;
}
