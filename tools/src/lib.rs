//! taskpilot tools: registry, dispatch pipeline and built-in workspace tools
//!
//! Every tool is reached through [`ToolRegistry::execute_tool`], which resolves,
//! normalizes, validates and permission-checks a call before running it.

pub mod executor;
pub mod fs;
pub mod fuzzy;
pub mod normalize;
pub mod permission;
pub mod process;
pub mod registry;
pub mod schema;
pub mod types;

pub use fuzzy::{fuzzy_find, FuzzyMatch, MatchStrategy};
pub use permission::{
    ApprovalCallback, ApprovalRequest, ApprovalResponse, AutoApprover, PermissionGate,
    PermissionMode,
};
pub use registry::{is_destructive_tool, ToolRegistry, DESTRUCTIVE_TOOLS};
pub use types::{
    CallContext, ParamSpec, ParamType, Params, Tool, ToolCall, ToolDefinition, ToolError,
    ToolResult,
};
