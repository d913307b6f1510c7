//! Tool dispatch pipeline
//!
//! Pipeline: resolve → normalize → required check → coerce + schema validate → permission → execute

use std::time::Instant;
use tracing::{debug, info, warn};

use crate::normalize::{coerce_params, normalize_params};
use crate::registry::ToolRegistry;
use crate::schema::{missing_required, validate_params};
use crate::types::{CallContext, Params, ToolCall, ToolError, ToolResult};

impl ToolRegistry {
    /// Call parameters with synonyms rewritten the way dispatch will see them.
    /// Unknown tools get their parameters back unchanged.
    pub fn normalized_params(&self, call: &ToolCall) -> Params {
        match self.definition(&call.name) {
            Some(def) => normalize_params(def, call.params.clone()),
            None => call.params.clone(),
        }
    }

    /// Run one call through the full pipeline.
    ///
    /// Never fails past this boundary: unknown tools, bad parameters, denials,
    /// cancellation and panics inside the tool all come back as failed results.
    pub async fn execute_tool(&self, call: &ToolCall, ctx: &CallContext) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            let suggestions = self.suggest(&call.name);
            let hint = if suggestions.is_empty() {
                format!(" Available tools: {}", self.names().join(", "))
            } else {
                format!(" Did you mean: {}?", suggestions.join(", "))
            };
            warn!(tool = %call.name, "Unknown tool requested");
            return ToolError::UnknownTool {
                name: call.name.clone(),
                hint,
            }
            .into();
        };
        let def = tool.definition().clone();

        let mut params = normalize_params(&def, call.params.clone());

        let missing = missing_required(&def, &params);
        if !missing.is_empty() {
            return ToolError::MissingParams {
                tool: def.name.clone(),
                missing,
            }
            .into();
        }

        coerce_params(&def, &mut params);
        if let Err(e) = validate_params(&def, &params) {
            return ToolError::InvalidParams {
                tool: def.name.clone(),
                reason: e.to_string(),
            }
            .into();
        }

        if !ctx.trusted && !self.gate().check(&def, &params).await {
            return ToolError::PermissionDenied(def.name.clone()).into();
        }

        if ctx.cancel.is_cancelled() {
            return ToolResult::cancelled(&def.name);
        }

        info!(tool = %def.name, run_id = %ctx.run_id, "Executing tool");
        let start = Instant::now();

        // Spawned so a panicking tool surfaces as a JoinError instead of unwinding the loop
        let task_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { tool.execute(params, task_ctx).await });

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                handle.abort();
                warn!(tool = %def.name, "Tool execution cancelled");
                ToolResult::cancelled(&def.name)
            }
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => ToolResult::cancelled(&def.name),
                Err(e) => ToolError::Crashed {
                    tool: def.name.clone(),
                    message: panic_message(e),
                }
                .into(),
            },
        };

        debug!(
            tool = %def.name,
            success = result.success,
            "Tool finished in {}ms",
            start.elapsed().as_millis()
        );
        result
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "tool panicked".to_string()
            }
        }
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{PermissionGate, PermissionMode};
    use crate::types::{ParamSpec, ParamType, Params, Tool, ToolDefinition};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Echo {
        def: ToolDefinition,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(read_only: bool) -> Arc<Self> {
            let mut def = ToolDefinition::new("echoPath", "echo the path back")
                .param(ParamSpec::required("path", ParamType::String, "path"))
                .param(ParamSpec::optional("times", ParamType::Integer, "repeat"));
            def.read_only = read_only;
            Arc::new(Self {
                def,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }
        async fn execute(&self, params: Params, _ctx: CallContext) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok(Value::Object(params))
        }
    }

    struct Panics(ToolDefinition);

    #[async_trait]
    impl Tool for Panics {
        fn definition(&self) -> &ToolDefinition {
            &self.0
        }
        async fn execute(&self, _params: Params, _ctx: CallContext) -> ToolResult {
            panic!("disk on fire");
        }
    }

    struct Sleeps(ToolDefinition);

    #[async_trait]
    impl Tool for Sleeps {
        fn definition(&self) -> &ToolDefinition {
            &self.0
        }
        async fn execute(&self, _params: Params, _ctx: CallContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ToolResult::ok(json!("late"))
        }
    }

    fn call(name: &str, params: Value) -> ToolCall {
        ToolCall::new(name, params.as_object().cloned().unwrap_or_default())
    }

    fn registry_with(mode: PermissionMode, tool: Arc<dyn Tool>) -> ToolRegistry {
        let mut reg = ToolRegistry::new(PermissionGate::new(mode));
        reg.register(tool);
        reg
    }

    #[tokio::test]
    async fn test_unknown_tool_suggests() {
        let reg = registry_with(PermissionMode::Trusted, Echo::new(true));
        let r = reg.execute_tool(&call("echo", json!({})), &CallContext::new(".")).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("Did you mean: echoPath?"));
    }

    #[tokio::test]
    async fn test_normalizes_then_executes() {
        let echo = Echo::new(true);
        let reg = registry_with(PermissionMode::ReadOnly, echo.clone());
        let r = reg
            .execute_tool(&call("echoPath", json!({"file": "a.ts", "times": "2"})), &CallContext::new("."))
            .await;
        assert!(r.success);
        assert_eq!(r.data, Some(json!({"path": "a.ts", "times": 2})));
    }

    #[test]
    fn test_normalized_params_match_dispatch() {
        let reg = registry_with(PermissionMode::Trusted, Echo::new(true));
        let params = reg.normalized_params(&call("echoPath", json!({"filepath": "a.ts"})));
        assert_eq!(Value::Object(params), json!({"path": "a.ts"}));
        let raw = reg.normalized_params(&call("nope", json!({"file": "a.ts"})));
        assert_eq!(Value::Object(raw), json!({"file": "a.ts"}));
    }

    #[tokio::test]
    async fn test_missing_required_listed() {
        let reg = registry_with(PermissionMode::Trusted, Echo::new(true));
        let r = reg.execute_tool(&call("echoPath", json!({})), &CallContext::new(".")).await;
        assert_eq!(r.error.as_deref(), Some("echoPath: missing required parameters: path"));
    }

    #[tokio::test]
    async fn test_invalid_type_rejected() {
        let reg = registry_with(PermissionMode::Trusted, Echo::new(true));
        let r = reg
            .execute_tool(&call("echoPath", json!({"path": 5})), &CallContext::new("."))
            .await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("invalid parameters"));
    }

    #[tokio::test]
    async fn test_trusted_context_bypasses_gate() {
        let echo = Echo::new(false);
        let reg = registry_with(PermissionMode::Confirm, echo.clone());
        let mut ctx = CallContext::new(".");

        let denied = reg.execute_tool(&call("echoPath", json!({"path": "x"})), &ctx).await;
        assert!(!denied.success);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

        ctx.trusted = true;
        let allowed = reg.execute_tool(&call("echoPath", json!({"path": "x"})), &ctx).await;
        assert!(allowed.success);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_result() {
        let reg = registry_with(
            PermissionMode::Trusted,
            Arc::new(Panics(ToolDefinition::new("boom", "panics"))),
        );
        let r = reg.execute_tool(&call("boom", json!({})), &CallContext::new(".")).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks() {
        let reg = registry_with(
            PermissionMode::Trusted,
            Arc::new(Sleeps(ToolDefinition::new("slow", "sleeps"))),
        );
        let ctx = CallContext::new(".");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let r = reg.execute_tool(&call("slow", json!({})), &ctx).await;
        assert!(r.cancelled);
        assert!(!r.success);
    }
}
