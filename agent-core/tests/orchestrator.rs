use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use taskpilot_core::{
    AgentConfig, GenerationOptions, InferenceBackend, InferenceError, Message, Orchestrator,
    RunOptions, RunStatus, StepKind, TokenCallback,
};
use taskpilot_memory::{ConfidenceScorer, ExecutionRecord, LearningStore, ToolResultCache};
use taskpilot_tools::{
    CallContext, ParamSpec, ParamType, Params, PermissionGate, PermissionMode, Tool,
    ToolDefinition, ToolRegistry, ToolResult,
};

/// Replays canned responses, then answers "Done." Every prompt it receives is kept.
struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String, InferenceError>>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
    delay: Duration,
}

impl ScriptedBackend {
    fn build(script: Vec<Result<String, InferenceError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn new(script: Vec<Result<String, InferenceError>>) -> Arc<Self> {
        Self::build(script, Duration::ZERO)
    }

    fn replies(replies: &[&str]) -> Arc<Self> {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    fn slow(replies: &[&str], delay: Duration) -> Arc<Self> {
        Self::build(replies.iter().map(|r| Ok(r.to_string())).collect(), delay)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn prompts(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
        _cancel: &CancellationToken,
        _on_token: Option<&TokenCallback<'_>>,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Done.".to_string()))
    }
}

/// Never answers until cancelled
struct HangingBackend;

#[async_trait]
impl InferenceBackend for HangingBackend {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn generate(
        &self,
        _messages: &[Message],
        _options: &GenerationOptions,
        cancel: &CancellationToken,
        _on_token: Option<&TokenCallback<'_>>,
    ) -> Result<String, InferenceError> {
        cancel.cancelled().await;
        Err(InferenceError::Cancelled)
    }
}

/// Read-only tool that counts how often it really runs
struct InspectTool {
    def: ToolDefinition,
    runs: Arc<AtomicUsize>,
}

impl InspectTool {
    fn new(runs: Arc<AtomicUsize>) -> Self {
        Self {
            def: ToolDefinition::new("inspect", "Inspect a file")
                .param(ParamSpec::required("path", ParamType::String, "file"))
                .read_only(),
            runs,
        }
    }
}

#[async_trait]
impl Tool for InspectTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, params: Params, _ctx: CallContext) -> ToolResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ToolResult::ok(json!({ "path": params.get("path").cloned().unwrap_or(Value::Null), "lines": 3 }))
    }
}

/// Read-only tool that signals when it starts, then blocks until cancelled
struct BlockingTool {
    def: ToolDefinition,
    started: Arc<Notify>,
}

#[async_trait]
impl Tool for BlockingTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, _params: Params, ctx: CallContext) -> ToolResult {
        self.started.notify_one();
        ctx.cancel.cancelled().await;
        ToolResult::cancelled("block")
    }
}

fn tool_call(name: &str, params: Value) -> String {
    format!(
        "```json\n{}\n```",
        json!({ "name": name, "params": params })
    )
}

fn config(workspace: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.workspace_root = workspace.to_path_buf();
    config.retry.base_delay_ms = 1;
    config
}

fn orchestrator(workspace: &Path, backend: Arc<dyn InferenceBackend>, mode: PermissionMode) -> Orchestrator {
    let registry = ToolRegistry::with_builtin_tools(PermissionGate::new(mode));
    Orchestrator::new(config(workspace), backend, registry)
}

#[tokio::test]
async fn test_plain_answer_has_no_tool_steps() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replies(&["Paris is the capital of France."]);
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);

    let report = orch
        .run_detailed("what is the capital of France", Vec::new(), RunOptions::default())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_text, "Paris is the capital of France.");
    assert_eq!(report.steps_of(StepKind::ToolCall).count(), 0);
    assert_eq!(report.steps_of(StepKind::Answer).count(), 1);
    assert_eq!(report.iterations, 1);
    assert_eq!(backend.calls(), 1);
    assert!(!orch.is_running());
}

#[tokio::test]
async fn test_repeated_read_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::with_builtin_tools(PermissionGate::new(PermissionMode::ReadOnly));
    registry.register(Arc::new(InspectTool::new(runs.clone())));

    let inspect = tool_call("inspect", json!({"path": "a.txt"}));
    let backend = ScriptedBackend::replies(&[&inspect, &inspect, "The file has 3 lines."]);
    let orch = Orchestrator::new(config(dir.path()), backend, registry);

    let report = orch
        .run_detailed("inspect a.txt", Vec::new(), RunOptions::default())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_text, "The file has 3 lines.");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(report.cache_hits, 1);
    assert_eq!(orch.cache_stats().hits, 1);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![
        Err(InferenceError::Network("connection refused".into())),
        Err(InferenceError::Network("connection refused".into())),
        Err(InferenceError::Network("connection refused".into())),
        Ok("never reached".into()),
    ]);
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);

    let report = orch
        .run_detailed("list the files", Vec::new(), RunOptions::default())
        .await;

    assert_eq!(backend.calls(), 3);
    assert_eq!(report.status, RunStatus::Error);
    assert!(report.final_text.starts_with("Error:"));
    assert_eq!(report.steps_of(StepKind::Error).count(), 1);
}

#[tokio::test]
async fn test_trusted_run_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let write = tool_call("writeFile", json!({"path": "notes/out.txt", "content": "hello"}));
    let backend = ScriptedBackend::replies(&[&write, "Wrote notes/out.txt."]);
    let orch = orchestrator(dir.path(), backend, PermissionMode::Confirm);

    let report = orch
        .run_detailed("write hello to notes/out.txt", Vec::new(), RunOptions::trusted())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(std::fs::read_to_string(dir.path().join("notes/out.txt")).unwrap(), "hello");
    assert_eq!(report.modified_files, vec!["notes/out.txt".to_string()]);
    let results: Vec<_> = report.steps_of(StepKind::ToolResult).collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].success, Some(true));
}

#[tokio::test]
async fn test_destructive_tool_not_auto_approved() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let mut scorer = ConfidenceScorer::new().with_threshold(0.1);
    for _ in 0..30 {
        scorer.record_execution(ExecutionRecord::new("writeFile", true, 5));
    }
    let write = tool_call("writeFile", json!({"path": "out.txt", "content": "x"}));
    let backend = ScriptedBackend::replies(&[&write, "Could not write."]);
    let registry = ToolRegistry::with_builtin_tools(PermissionGate::new(PermissionMode::Confirm));
    let orch = Orchestrator::with_components(
        config.clone(),
        backend,
        registry,
        Arc::new(Mutex::new(scorer)),
        Arc::new(Mutex::new(LearningStore::new(config.learning.to_learning_config()))),
        Arc::new(ToolResultCache::new(config.cache.to_cache_config())),
    );

    let report = orch
        .run_detailed("write x to out.txt", Vec::new(), RunOptions::default())
        .await;

    assert!(!dir.path().join("out.txt").exists());
    let result = report.steps_of(StepKind::ToolResult).next().unwrap();
    assert_eq!(result.success, Some(false));
    assert!(report.modified_files.is_empty());
}

#[tokio::test]
async fn test_repeated_failures_trigger_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let read = tool_call("readFile", json!({"path": "missing.txt"}));
    let backend = ScriptedBackend::replies(&[&read, &read, &read, &read, &read]);
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);

    let report = orch
        .run_detailed("read missing.txt", Vec::new(), RunOptions::default())
        .await;

    assert!(orch
        .events()
        .recent_events()
        .iter()
        .any(|e| e.kind() == "cycle_detected"));
    assert_eq!(report.iterations, 3);
    assert_eq!(backend.calls(), 3);
    assert!(report.final_text.contains("stuck repeating"));
    assert_eq!(report.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_plan_mode_returns_plan() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replies(&[
        r#"{"plan": {"title": "Rename the module", "steps": ["Find usages", "Rename", "Run tests"]}}"#,
    ]);
    let orch = orchestrator(dir.path(), backend, PermissionMode::ReadOnly);
    let opts = RunOptions {
        plan_mode: Some(true),
        ..Default::default()
    };

    let report = orch
        .run_detailed("rename the parser module", Vec::new(), opts)
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    let plan = report.plan.as_ref().expect("plan");
    assert_eq!(plan.title, "Rename the module");
    assert_eq!(plan.steps.len(), 3);
    assert!(report.final_text.ends_with("Approve the plan to continue."));
    assert_eq!(report.steps_of(StepKind::Plan).count(), 1);
}

async fn wait_until_running(orch: &Orchestrator) {
    while !orch.is_running() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_abort_stops_run() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path(), Arc::new(HangingBackend), PermissionMode::ReadOnly);
    let mut events = orch.subscribe();

    let (report, aborted) = tokio::join!(
        orch.run_detailed("summarize the repo", Vec::new(), RunOptions::default()),
        async {
            wait_until_running(&orch).await;
            orch.abort()
        }
    );

    assert!(aborted);
    assert_eq!(report.status, RunStatus::Aborted);
    assert!(!orch.is_running());
    assert!(!orch.abort());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(kinds.first(), Some(&"started"));
    assert_eq!(kinds.last(), Some(&"aborted"));
}

#[tokio::test]
async fn test_second_run_rejected_while_active() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path(), Arc::new(HangingBackend), PermissionMode::ReadOnly);

    let (first, second) = tokio::join!(
        orch.run_detailed("first task", Vec::new(), RunOptions::default()),
        async {
            wait_until_running(&orch).await;
            let second = orch
                .run_detailed("second task", Vec::new(), RunOptions::default())
                .await;
            orch.abort();
            second
        }
    );

    assert_eq!(second.status, RunStatus::Error);
    assert_eq!(second.final_text, "Error: a run is already active");
    assert_eq!(first.status, RunStatus::Aborted);
}

#[tokio::test]
async fn test_prior_transcript_and_subgoals() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let read = tool_call("readFile", json!({"path": "a.txt"}));
    let backend = ScriptedBackend::replies(&[&read, "a.txt says alpha.", "Nothing else to do."]);
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);

    let prior = vec![
        Message::system("ignored"),
        Message::user("earlier question"),
        Message::assistant("earlier answer"),
    ];
    let report = orch
        .run_detailed("read a.txt, then summarize it", prior, RunOptions::default())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_text, "a.txt says alpha.");
    assert_eq!(backend.calls(), 2);
    assert_eq!(report.steps_of(StepKind::Answer).count(), 1);

    let first = &backend.prompts()[0];
    assert!(first[0].content.contains("## Suggested steps\n1. read a.txt\n2. summarize it"));
    assert!(first.iter().all(|m| m.content != "ignored"));
    assert_eq!(first[1].content, "earlier question");
}

#[tokio::test]
async fn test_plain_text_is_final_for_unmatched_task() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replies(&["The storage layer is already clean; nothing to change."]);
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);

    let report = orch
        .run_detailed("refactor the storage layer", Vec::new(), RunOptions::default())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_text, "The storage layer is already clean; nothing to change.");
    assert_eq!(backend.calls(), 1);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.steps_of(StepKind::Answer).count(), 1);
}

#[tokio::test]
async fn test_time_limit_stops_with_summary() {
    let dir = tempfile::tempdir().unwrap();
    let list = tool_call("listDirectory", json!({"path": "."}));
    let backend = ScriptedBackend::slow(&[&list, &list], Duration::from_millis(50));
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);
    let opts = RunOptions {
        max_duration_ms: Some(20),
        ..Default::default()
    };

    let report = orch.run_detailed("list the files", Vec::new(), opts).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(backend.calls(), 1);
    assert!(report
        .final_text
        .starts_with("Stopped after 1 iteration(s): time limit exceeded."));
    let errors: Vec<_> = report.steps_of(StepKind::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].content, "Time limit exceeded");
}

#[tokio::test]
async fn test_abort_mid_batch_keeps_earlier_results() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let mut registry = ToolRegistry::with_builtin_tools(PermissionGate::new(PermissionMode::ReadOnly));
    registry.register(Arc::new(InspectTool::new(runs.clone())));
    registry.register(Arc::new(BlockingTool {
        def: ToolDefinition::new("block", "Wait for cancellation").read_only(),
        started: started.clone(),
    }));

    let batch = format!(
        "{}\n{}\n{}",
        tool_call("inspect", json!({"path": "a.txt"})),
        tool_call("block", json!({})),
        tool_call("inspect", json!({"path": "b.txt"}))
    );
    let backend = ScriptedBackend::replies(&[&batch]);
    let orch = Orchestrator::new(config(dir.path()), backend, registry);

    let (report, aborted) = tokio::join!(
        orch.run_detailed("inspect a.txt and b.txt", Vec::new(), RunOptions::default()),
        async {
            started.notified().await;
            orch.abort()
        }
    );

    assert!(aborted);
    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let results: Vec<_> = report.steps_of(StepKind::ToolResult).collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].tool.as_deref(), Some("inspect"));
    assert_eq!(results[0].success, Some(true));
    assert_eq!(results[1].tool.as_deref(), Some("block"));
    assert_eq!(results[1].success, Some(false));
    assert_eq!(report.steps_of(StepKind::ToolCall).count(), 2);
}

#[tokio::test]
async fn test_file_modified_once_per_path_with_synonyms() {
    let dir = tempfile::tempdir().unwrap();
    let first = tool_call("writeFile", json!({"path": "notes.txt", "content": "a"}));
    let second = tool_call("writeFile", json!({"filepath": "notes.txt", "content": "b"}));
    let backend = ScriptedBackend::replies(&[&first, &second, "Wrote notes.txt twice."]);
    let orch = orchestrator(dir.path(), backend, PermissionMode::Confirm);

    let report = orch
        .run_detailed("write notes.txt", Vec::new(), RunOptions::trusted())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "b");
    assert_eq!(report.modified_files, vec!["notes.txt".to_string()]);
    let modified_events = orch
        .events()
        .recent_events()
        .iter()
        .filter(|e| e.kind() == "file_modified")
        .count();
    assert_eq!(modified_events, 1);
}

#[tokio::test]
async fn test_cache_keys_on_normalized_params_and_write_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "stale").unwrap();
    let backend = ScriptedBackend::replies(&[
        &tool_call("readFile", json!({"file": "a.txt"})),
        &tool_call("readFile", json!({"path": "a.txt"})),
        &tool_call("writeFile", json!({"filepath": "a.txt", "content": "fresh"})),
        &tool_call("readFile", json!({"path": "a.txt"})),
        "a.txt now says fresh.",
    ]);
    let orch = orchestrator(dir.path(), backend, PermissionMode::Confirm);

    let report = orch
        .run_detailed("update a.txt", Vec::new(), RunOptions::trusted())
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.cache_hits, 1);
    assert_eq!(report.modified_files, vec!["a.txt".to_string()]);
    let last_read = report
        .steps_of(StepKind::ToolResult)
        .last()
        .expect("tool results");
    assert!(last_read.content.contains("fresh"));
    assert!(orch.cache_stats().invalidations >= 1);
}

#[tokio::test]
async fn test_oversized_history_trimmed_before_inference() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replies(&["Nothing to add."]);
    let orch = orchestrator(dir.path(), backend.clone(), PermissionMode::ReadOnly);
    let huge = "x".repeat(200_000);
    let prior = vec![Message::user(huge.clone()), Message::assistant("ok")];

    let report = orch
        .run_detailed("what did I paste", prior, RunOptions::default())
        .await;

    assert_eq!(report.final_text, "Nothing to add.");
    let sent = &backend.prompts()[0];
    assert!(sent.iter().all(|m| m.content != huge));
    assert_eq!(sent.last().map(|m| m.content.as_str()), Some("what did I paste"));
    let chars: usize = sent.iter().map(|m| m.content.chars().count()).sum();
    assert!(chars.div_ceil(4) <= config(dir.path()).agent.context_window_tokens + sent.len());
}

#[tokio::test]
async fn test_confident_read_auto_approved_in_confirm_mode() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let config = config(dir.path());

    let mut scorer = ConfidenceScorer::new().with_threshold(0.1);
    for _ in 0..30 {
        scorer.record_execution(ExecutionRecord::new("readFile", true, 5));
    }
    let read = tool_call("readFile", json!({"path": "a.txt"}));
    let backend = ScriptedBackend::replies(&[&read, "a.txt says alpha."]);
    let registry = ToolRegistry::with_builtin_tools(PermissionGate::new(PermissionMode::Confirm));
    let orch = Orchestrator::with_components(
        config.clone(),
        backend,
        registry,
        Arc::new(Mutex::new(scorer)),
        Arc::new(Mutex::new(LearningStore::new(config.learning.to_learning_config()))),
        Arc::new(ToolResultCache::new(config.cache.to_cache_config())),
    );

    let report = orch
        .run_detailed("read a.txt", Vec::new(), RunOptions::default())
        .await;

    let result = report.steps_of(StepKind::ToolResult).next().unwrap();
    assert_eq!(result.success, Some(true));
    assert!(result.content.contains("alpha"));
}
