//! Orchestrator: the think-act-observe loop
//!
//! One run at a time. Each iteration asks the model for a response, parses
//! it into a plan, a final answer or tool calls, executes the calls through
//! the registry and folds the observations back into the transcript. The
//! budget allocator, cycle detector and goal stack decide when to stop.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use async_trait::async_trait;
use taskpilot_memory::{
    cache_key, CacheStats, ConfidenceContext, ConfidenceScorer, CorrectionContext,
    ExecutionRecord, LearningStore, NewCorrection, ToolResultCache,
};
use taskpilot_tools::{
    ApprovalRequest, AutoApprover, CallContext, Params, ToolCall, ToolRegistry, ToolResult,
};

use crate::budget::{BudgetAllocator, BudgetDecision, ProgressMetrics};
use crate::complexity::{ComplexityContext, ComplexityEstimator};
use crate::config::AgentConfig;
use crate::context::{truncate_tool_output, ContextAssembler, PromptInputs};
use crate::cycle::{CycleDetector, CycleSeverity};
use crate::events::{AgentEvent, EventEmitter};
use crate::goal_stack::GoalStack;
use crate::inference::{
    generate_with_retry, GenerationOptions, InferenceBackend, InferenceError, Message,
    RetryPolicy, Role, TokenCallback,
};
use crate::intent::{IntentClassification, IntentClassifier};
use crate::parser::{extract_thinking, ParsedResponse, ProposedPlan, ResponseParser};
use crate::planner::plan_subgoals;
use crate::run::{RunOptions, RunReport, RunStatus, StepKind, StepLog};

const CONTINUE_PROMPT: &str =
    "Continue with the task. Call more tools if needed, or reply with a final summary when done.";
const EMPTY_REPLY_PROMPT: &str =
    "Your last reply was empty. Continue working on the task or give your final answer.";
const ALREADY_RUNNING: &str = "Error: a run is already active";
const MAX_LEARNED_HINTS: usize = 5;
const TOOL_ERROR: &str = "tool_error";
const INFERENCE_ERROR: &str = "inference";
const STUCK: &str = "stuck repeating the same actions";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The file a call targets, read from registry-normalized params
fn target_path(params: &Params) -> Option<&str> {
    params
        .get("path")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    }
}

// ---------------------------------------------------------------------------
// Confidence-backed auto approval
// ---------------------------------------------------------------------------

/// Lets the permission gate skip the prompt for tools with a strong track record
pub struct ScorerAutoApprover {
    scorer: Arc<Mutex<ConfidenceScorer>>,
}

impl ScorerAutoApprover {
    pub fn new(scorer: Arc<Mutex<ConfidenceScorer>>) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl AutoApprover for ScorerAutoApprover {
    async fn auto_approve(&self, request: &ApprovalRequest) -> bool {
        let ctx = ConfidenceContext::for_path(target_path(&request.params), None);
        let decision = lock(&self.scorer).should_auto_approve(&request.tool, &ctx);
        debug!(
            tool = %request.tool,
            approved = decision.approved,
            score = decision.score,
            "Auto-approval: {}",
            decision.reason
        );
        decision.approved
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

/// Clears the active-run slot when the run ends, however it ends
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

struct RunState {
    run_id: String,
    category: String,
    iteration: u32,
    steps: StepLog,
    modified: Vec<String>,
    attempts: u32,
    successes: u32,
    tools_used: Vec<String>,
    stagnation: u32,
    cache_hits: u64,
    /// target -> last error, for pairing a later success with the failure
    failed_targets: HashMap<String, String>,
}

impl RunState {
    fn new(run_id: &str, category: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            category: category.to_string(),
            iteration: 0,
            steps: StepLog::default(),
            modified: Vec::new(),
            attempts: 0,
            successes: 0,
            tools_used: Vec::new(),
            stagnation: 0,
            cache_hits: 0,
            failed_targets: HashMap::new(),
        }
    }

    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.5
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn summary(&self, reason: &str) -> String {
        let mut out = format!(
            "Stopped after {} iteration(s): {reason}.\nTool calls: {} ({} succeeded).\n",
            self.iteration, self.attempts, self.successes
        );
        if !self.tools_used.is_empty() {
            out.push_str(&format!("Tools used: {}\n", self.tools_used.join(", ")));
        }
        if self.modified.is_empty() {
            out.push_str("No files were modified.");
        } else {
            out.push_str(&format!("Files modified: {}", self.modified.join(", ")));
        }
        out
    }
}

struct CallOutcome {
    result: ToolResult,
    cached: bool,
    duration_ms: u64,
}

/// How a run ended: status, final text and an optional proposed plan
type Ending = (RunStatus, String, Option<ProposedPlan>);

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: AgentConfig,
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<ToolRegistry>,
    scorer: Arc<Mutex<ConfidenceScorer>>,
    learning: Arc<Mutex<LearningStore>>,
    cache: Arc<ToolResultCache>,
    classifier: IntentClassifier,
    estimator: ComplexityEstimator,
    budgets: BudgetAllocator,
    parser: ResponseParser,
    context: ContextAssembler,
    cycles: Mutex<CycleDetector>,
    events: EventEmitter,
    active: Mutex<Option<ActiveRun>>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, backend: Arc<dyn InferenceBackend>, registry: ToolRegistry) -> Self {
        let scorer = ConfidenceScorer::new().with_threshold(config.confidence.auto_approve_threshold);
        let learning = LearningStore::new(config.learning.to_learning_config());
        let cache = ToolResultCache::new(config.cache.to_cache_config());
        Self::with_components(
            config,
            backend,
            registry,
            Arc::new(Mutex::new(scorer)),
            Arc::new(Mutex::new(learning)),
            Arc::new(cache),
        )
    }

    /// Build around existing stores, e.g. ones loaded from disk
    pub fn with_components(
        config: AgentConfig,
        backend: Arc<dyn InferenceBackend>,
        mut registry: ToolRegistry,
        scorer: Arc<Mutex<ConfidenceScorer>>,
        learning: Arc<Mutex<LearningStore>>,
        cache: Arc<ToolResultCache>,
    ) -> Self {
        lock(&scorer).set_destructive_tools(registry.destructive_names());
        registry
            .gate_mut()
            .set_auto_approver(Arc::new(ScorerAutoApprover::new(scorer.clone())));

        info!(
            backend = backend.name(),
            tools = registry.count(),
            "Orchestrator ready"
        );
        Self {
            budgets: BudgetAllocator::new(config.budget.clone()),
            context: ContextAssembler::new(config.agent.context_window_tokens),
            retry: RetryPolicy::new(
                config.retry.max_attempts,
                Duration::from_millis(config.retry.base_delay_ms),
            ),
            config,
            backend,
            registry: Arc::new(registry),
            scorer,
            learning,
            cache,
            classifier: IntentClassifier::new(),
            estimator: ComplexityEstimator::new(),
            parser: ResponseParser::new(),
            cycles: Mutex::new(CycleDetector::new()),
            events: EventEmitter::new(),
            active: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn scorer(&self) -> Arc<Mutex<ConfidenceScorer>> {
        self.scorer.clone()
    }

    pub fn learning(&self) -> Arc<Mutex<LearningStore>> {
        self.learning.clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Cancel the active run. Returns false when nothing is running.
    pub fn abort(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(run) => {
                info!(run_id = %run.run_id, "Abort requested");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget session-scoped permission grants and loop history
    pub fn reset_session(&self) {
        self.registry.reset_session();
        lock(&self.cycles).reset();
    }

    /// Run an instruction and return the final text
    pub async fn run(&self, instruction: &str, prior: Vec<Message>, opts: RunOptions) -> String {
        self.run_detailed(instruction, prior, opts).await.final_text
    }

    pub async fn run_detailed(&self, instruction: &str, prior: Vec<Message>, opts: RunOptions) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let Some(_guard) = self.begin(&run_id, &cancel) else {
            warn!("Refusing to start a run while another is active");
            return rejected_report(run_id);
        };

        let plan_mode = opts.plan_mode.unwrap_or(self.config.agent.plan_mode);
        let max_iterations = opts
            .max_iterations
            .unwrap_or(self.config.agent.max_iterations)
            .max(1);
        let max_duration = Duration::from_millis(
            opts.max_duration_ms
                .unwrap_or(self.config.agent.max_duration_ms),
        );
        let workspace = opts
            .workspace_root
            .clone()
            .unwrap_or_else(|| self.config.agent.workspace_root.clone());
        let started = Instant::now();

        info!(run_id = %run_id, plan_mode, "Run started: {}", preview(instruction));
        self.events.emit(AgentEvent::Started {
            run_id: run_id.clone(),
            instruction: instruction.to_string(),
        });
        lock(&self.cycles).reset();

        let intent = self.classifier.classify(instruction);
        let estimate = self
            .estimator
            .estimate(instruction, Some(&intent), &ComplexityContext::default());
        let budget = self.budgets.allocate_from_estimate(&run_id, &estimate);
        info!(
            run_id = %run_id,
            category = intent.category.as_str(),
            complexity = ?estimate.level,
            budget = budget.total,
            "Task classified"
        );

        let mut goals = GoalStack::new();
        let root = goals.set_root(
            instruction,
            intent.file_references.clone(),
            Some(intent.complexity),
        );
        let subgoals = plan_subgoals(instruction, &intent);
        if !subgoals.is_empty() {
            if let Err(e) = goals.decompose(&root, subgoals) {
                warn!("Could not decompose task: {e}");
            }
        }
        goals.activate_next();
        let outline: Vec<String> = goals
            .children(&root)
            .iter()
            .map(|g| g.description.clone())
            .collect();

        let tools = self.registry.definitions();
        let hints = self.learned_hints();
        let mut messages = vec![Message::system(String::new())];
        messages.extend(prior.into_iter().filter(|m| m.role != Role::System));
        messages.push(Message::user(instruction));

        let call_ctx = CallContext {
            workspace_root: workspace.clone(),
            cancel: cancel.clone(),
            run_id: run_id.clone(),
            trusted: opts.trusted,
        };
        let gen_options = GenerationOptions {
            temperature: self.config.inference.temperature,
            max_tokens: self.config.inference.max_tokens,
            response_schema: None,
        };
        let mut state = RunState::new(&run_id, intent.category.as_str());

        let (status, final_text, plan): Ending = loop {
            if cancel.is_cancelled() {
                break (RunStatus::Aborted, "Run aborted.".to_string(), None);
            }
            if started.elapsed() > max_duration {
                self.step(&mut state, StepKind::Error, "Time limit exceeded", None, Some(false));
                break (RunStatus::Completed, state.summary("time limit exceeded"), None);
            }
            if state.iteration >= max_iterations {
                break (RunStatus::Completed, state.summary("iteration limit reached"), None);
            }

            state.iteration += 1;
            let budget_total = self.budgets.get(&run_id).map_or(0, |b| b.total);
            debug!(run_id = %run_id, iteration = state.iteration, budget = budget_total, "Iteration");
            self.events.emit(AgentEvent::Iteration {
                run_id: run_id.clone(),
                iteration: state.iteration,
                budget: budget_total,
            });

            let assembled = self.context.assemble(&PromptInputs {
                workspace_root: &workspace,
                tools: &tools,
                intent: Some(&intent),
                subgoals: &outline,
                plan_mode,
                learned_hints: &hints,
            });
            messages[0] = Message::system(assembled.system_prompt);
            let trimmed = self.context.trim(&mut messages);
            if trimmed.dropped > 0 || trimmed.truncated {
                info!(
                    run_id = %run_id,
                    dropped = trimmed.dropped,
                    truncated = trimmed.truncated,
                    "Transcript trimmed to fit the context window"
                );
            }

            let on_token: &TokenCallback<'_> = &|text: &str| {
                self.events.emit(AgentEvent::Token {
                    run_id: run_id.clone(),
                    text: text.to_string(),
                });
            };
            let generated = generate_with_retry(
                self.backend.as_ref(),
                &messages,
                &gen_options,
                &self.retry,
                &cancel,
                Some(on_token),
                |attempt, err| debug!(attempt, kind = err.kind(), "Retrying inference"),
            )
            .await;
            let response = match generated {
                Ok(text) => text,
                Err(InferenceError::Cancelled) => {
                    break (RunStatus::Aborted, "Run aborted.".to_string(), None);
                }
                Err(e) => {
                    self.record_inference_failure(&e);
                    let text = format!("Error: {e}");
                    self.step(&mut state, StepKind::Error, text.clone(), None, Some(false));
                    self.events.emit(AgentEvent::Error {
                        run_id: run_id.clone(),
                        message: e.to_string(),
                    });
                    break (RunStatus::Error, text, None);
                }
            };

            let (thinking, visible) = extract_thinking(&response);
            if let Some(thought) = thinking {
                self.step(&mut state, StepKind::Thinking, thought, None, None);
            }

            let calls = match self.parser.parse(&visible, plan_mode) {
                ParsedResponse::Plan(plan) => {
                    let text = plan.describe();
                    info!(run_id = %run_id, steps = plan.steps.len(), "Plan proposed");
                    self.step(&mut state, StepKind::Plan, text.clone(), None, None);
                    self.events.emit(AgentEvent::PlanProposed {
                        run_id: run_id.clone(),
                        plan: plan.clone(),
                    });
                    break (RunStatus::Completed, text, Some(plan));
                }
                ParsedResponse::PlainText(text) if text.trim().is_empty() => {
                    self.step(&mut state, StepKind::Error, "Model returned an empty response", None, Some(false));
                    messages.push(Message::assistant(response.clone()));
                    messages.push(Message::user(EMPTY_REPLY_PROMPT));
                    Vec::new()
                }
                ParsedResponse::PlainText(text) => {
                    complete_all(&mut goals);
                    self.step(&mut state, StepKind::Answer, text.clone(), None, None);
                    break (RunStatus::Completed, text, None);
                }
                ParsedResponse::ToolCalls { calls, .. } => calls,
            };

            if calls.is_empty() {
                state.stagnation += 1;
            } else {
                let modified_before = state.modified.len();
                let mut actions = Vec::new();
                let mut targets = Vec::new();
                let mut observations = Vec::new();
                let mut batch_successes = 0;

                for call in &calls {
                    if cancel.is_cancelled() {
                        info!(run_id = %run_id, "Cancelled, skipping remaining tool calls");
                        break;
                    }
                    actions.push(call.name.clone());
                    let normalized = self.registry.normalized_params(call);
                    let target = target_path(&normalized).map(str::to_string);
                    if let Some(path) = &target {
                        targets.push(path.clone());
                    }
                    let params = Value::Object(call.params.clone());
                    self.step(&mut state, StepKind::ToolCall, format!("{}({params})", call.name), Some(&call.name), None);
                    self.events.emit(AgentEvent::ToolExecuting {
                        run_id: run_id.clone(),
                        tool: call.name.clone(),
                        params,
                    });

                    let outcome = self
                        .execute_call(call, &normalized, target.as_deref(), &call_ctx, &mut state)
                        .await;
                    let success = outcome.result.success;
                    state.attempts += 1;
                    if success {
                        state.successes += 1;
                        batch_successes += 1;
                    }
                    if !state.tools_used.contains(&call.name) {
                        state.tools_used.push(call.name.clone());
                    }

                    let rendered = truncate_tool_output(
                        &outcome.result.render(),
                        self.config.agent.tool_result_max_chars,
                    );
                    self.step(&mut state, StepKind::ToolResult, rendered.clone(), Some(&call.name), Some(success));
                    self.events.emit(AgentEvent::ToolResult {
                        run_id: run_id.clone(),
                        tool: call.name.clone(),
                        success,
                        cached: outcome.cached,
                        duration_ms: outcome.duration_ms,
                    });

                    let mut hints = Vec::new();
                    if success {
                        self.note_success(call, target.as_deref(), &mut state);
                    } else if !outcome.result.cancelled {
                        hints = self.learn_from_failure(
                            call,
                            target.as_deref(),
                            &outcome.result,
                            &intent,
                            &mut state,
                        );
                    }
                    observations.push(format_observation(&call.name, success, &rendered, &hints));
                }

                let mut feedback = observations.join("\n\n");
                let goal_key = goals.root().map(|g| g.id.clone()).unwrap_or_default();
                let all_failed = !actions.is_empty() && batch_successes == 0;
                let cycle = lock(&self.cycles).record(&actions, &targets, &goal_key, all_failed);
                if let Some(report) = cycle {
                    self.events.emit(AgentEvent::CycleDetected {
                        run_id: run_id.clone(),
                        report: report.clone(),
                    });
                    if report.severity == CycleSeverity::High {
                        self.step(
                            &mut state,
                            StepKind::Error,
                            format!("Cycle detected: {}", report.description),
                            None,
                            Some(false),
                        );
                        if let Err(e) = goals.fail(&goal_key, &report.description) {
                            warn!("Could not fail goal {goal_key}: {e}");
                        }
                        break (RunStatus::Completed, state.summary(STUCK), None);
                    } else {
                        feedback.push_str(&format!("\n\nNote: {}", report.suggestion.hint()));
                    }
                }

                messages.push(Message::assistant(response));
                messages.push(Message::user(format!("{feedback}\n\n{CONTINUE_PROMPT}")));

                if batch_successes > 0 || state.modified.len() > modified_before {
                    state.stagnation = 0;
                } else {
                    state.stagnation += 1;
                }
            }

            let metrics = ProgressMetrics {
                iterations: state.iteration,
                success_rate: state.success_rate(),
                confidence: self.mean_confidence(&state),
                stagnation: state.stagnation,
            };
            match self.budgets.check_and_adjust(&run_id, &metrics) {
                BudgetDecision::Stop(reason) => {
                    info!(run_id = %run_id, "Stopping: {}", reason.as_str());
                    break (RunStatus::Completed, state.summary(reason.as_str()), None);
                }
                BudgetDecision::BonusGranted { amount, total } => {
                    debug!(run_id = %run_id, amount, total, "Budget extended");
                }
                BudgetDecision::Compressed { total } => {
                    debug!(run_id = %run_id, total, "Budget compressed");
                }
                BudgetDecision::Continue => {}
            }
        };

        match status {
            RunStatus::Aborted => {
                info!(run_id = %run_id, "Run aborted");
                self.events.emit(AgentEvent::Aborted { run_id: run_id.clone() });
            }
            _ => {
                info!(
                    run_id = %run_id,
                    status = ?status,
                    iterations = state.iteration,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Run finished"
                );
                self.events.emit(AgentEvent::Completed {
                    run_id: run_id.clone(),
                    status,
                    iterations: state.iteration,
                });
            }
        }

        RunReport {
            budget: self.budgets.release(&run_id),
            run_id,
            status,
            final_text,
            iterations: state.iteration,
            cache_hits: state.cache_hits,
            modified_files: state.modified,
            steps: state.steps.into_vec(),
            plan,
        }
    }

    fn begin(&self, run_id: &str, cancel: &CancellationToken) -> Option<ActiveGuard<'_>> {
        let mut slot = lock(&self.active);
        if slot.is_some() {
            return None;
        }
        *slot = Some(ActiveRun {
            run_id: run_id.to_string(),
            cancel: cancel.clone(),
        });
        Some(ActiveGuard { slot: &self.active })
    }

    fn step(
        &self,
        state: &mut RunState,
        kind: StepKind,
        content: impl Into<String>,
        tool: Option<&str>,
        success: Option<bool>,
    ) {
        let step = state
            .steps
            .push(kind, content, tool, success, state.iteration)
            .clone();
        self.events.emit(AgentEvent::StepAdded {
            run_id: state.run_id.clone(),
            step,
        });
    }

    /// Serve read-only calls from the cache, otherwise dispatch through the registry
    async fn execute_call(
        &self,
        call: &ToolCall,
        params: &Params,
        target: Option<&str>,
        base: &CallContext,
        state: &mut RunState,
    ) -> CallOutcome {
        let key = self
            .registry
            .is_read_only(&call.name)
            .then(|| cache_key(&call.name, params));
        if let Some(value) = key.as_deref().and_then(|k| self.cache.get(k)) {
            match serde_json::from_value::<ToolResult>(value) {
                Ok(result) => {
                    state.cache_hits += 1;
                    debug!(tool = %call.name, "Served from cache");
                    return CallOutcome {
                        result,
                        cached: true,
                        duration_ms: 0,
                    };
                }
                Err(e) => warn!(tool = %call.name, "Discarding unreadable cache entry: {e}"),
            }
        }

        let ctx = CallContext {
            cancel: base.cancel.child_token(),
            ..base.clone()
        };
        let started = Instant::now();
        let result = self.registry.execute_tool(call, &ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(key) = key.filter(|_| result.success) {
            let dep = target.map_or_else(|| ctx.workspace_root.clone(), |p| ctx.resolve(p));
            match serde_json::to_value(&result) {
                Ok(value) => self.cache.put(key, value, vec![dep]),
                Err(e) => warn!(tool = %call.name, "Result not cacheable: {e}"),
            }
        }

        if result.success && self.registry.is_destructive(&call.name) {
            match target {
                Some(path) => {
                    let dropped = self.cache.invalidate_path(&ctx.resolve(path));
                    debug!(path, dropped, "Invalidated cached results");
                }
                None => self.cache.invalidate_all(),
            }
        }

        if self.registry.get(&call.name).is_some() {
            let ext_ctx = ConfidenceContext::for_path(target, Some(&state.category));
            let record = ExecutionRecord {
                cancelled: result.cancelled,
                file_extension: ext_ctx.file_extension,
                task_category: ext_ctx.task_category,
                ..ExecutionRecord::new(&call.name, result.success, duration_ms)
            };
            lock(&self.scorer).record_execution(record);
        }

        CallOutcome {
            result,
            cached: false,
            duration_ms,
        }
    }

    fn note_success(&self, call: &ToolCall, target: Option<&str>, state: &mut RunState) {
        let modifies = self
            .registry
            .definition(&call.name)
            .is_some_and(|d| d.modifies_files);
        if let Some(path) = target.filter(|_| modifies) {
            if !state.modified.iter().any(|p| p == path) {
                info!(run_id = %state.run_id, path, "File modified");
                state.modified.push(path.to_string());
                self.events.emit(AgentEvent::FileModified {
                    run_id: state.run_id.clone(),
                    path: path.to_string(),
                });
            }
        }

        let key = target.unwrap_or(&call.name);
        if let Some(error) = state.failed_targets.remove(key) {
            lock(&self.learning).record_correction(NewCorrection {
                error_type: TOOL_ERROR.to_string(),
                error_message: error,
                tool: call.name.clone(),
                fix_description: format!("use {} on the same target", call.name),
                success: true,
                context: target.map(CorrectionContext::for_path).unwrap_or_default(),
            });
        }
    }

    /// Record the failure and collect hints for the next prompt
    fn learn_from_failure(
        &self,
        call: &ToolCall,
        target: Option<&str>,
        result: &ToolResult,
        intent: &IntentClassification,
        state: &mut RunState,
    ) -> Vec<String> {
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        let correction_ctx = target.map(CorrectionContext::for_path).unwrap_or_default();
        let mut hints = Vec::new();

        {
            let mut learning = lock(&self.learning);
            learning.record_correction(NewCorrection {
                error_type: TOOL_ERROR.to_string(),
                error_message: error.clone(),
                tool: call.name.clone(),
                fix_description: format!("{} attempt", call.name),
                success: false,
                context: correction_ctx.clone(),
            });
            if let Some(rec) = learning.get_adaptive_tool_selection(
                TOOL_ERROR,
                &error,
                &call.name,
                Some(&correction_ctx),
            ) {
                hints.push(format!(
                    "Similar errors were resolved with {} ({:.0}% success vs {:.0}% for {}).",
                    rec.tool,
                    rec.success_rate * 100.0,
                    rec.current_success_rate * 100.0,
                    call.name
                ));
            }
            for fix in learning.suggested_solutions(TOOL_ERROR, &error, 2) {
                hints.push(format!("Previously fixed by: {fix}"));
            }
        }

        let alternatives: Vec<&str> = intent.preferred_tools.iter().map(String::as_str).collect();
        let ctx = ConfidenceContext::for_path(target, Some(&state.category));
        for suggestion in lock(&self.scorer)
            .get_adaptive_suggestions(&call.name, &alternatives, &ctx)
            .into_iter()
            .take(2)
        {
            hints.push(format!(
                "{} has a better track record here (confidence {:.2}).",
                suggestion.tool, suggestion.score
            ));
        }

        state
            .failed_targets
            .insert(target.unwrap_or(&call.name).to_string(), error);
        hints
    }

    fn record_inference_failure(&self, error: &InferenceError) {
        warn!(kind = error.kind(), "Inference failed: {error}");
        lock(&self.learning).record_correction(NewCorrection {
            error_type: INFERENCE_ERROR.to_string(),
            error_message: error.to_string(),
            tool: self.backend.name().to_string(),
            fix_description: "retry the request".to_string(),
            success: false,
            context: CorrectionContext::default(),
        });
    }

    fn mean_confidence(&self, state: &RunState) -> f64 {
        if state.tools_used.is_empty() {
            return 0.5;
        }
        let scorer = lock(&self.scorer);
        let ctx = ConfidenceContext::for_path(None, Some(&state.category));
        let total: f64 = state
            .tools_used
            .iter()
            .map(|t| scorer.calculate_confidence(t, &ctx).score)
            .sum();
        total / state.tools_used.len() as f64
    }

    /// Most frequent error patterns that have a known fix
    fn learned_hints(&self) -> Vec<String> {
        let learning = lock(&self.learning);
        let mut patterns: Vec<_> = learning
            .patterns()
            .filter(|p| !p.solutions.is_empty())
            .collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        patterns
            .into_iter()
            .take(MAX_LEARNED_HINTS)
            .filter_map(|p| {
                p.solutions
                    .first()
                    .map(|(fix, _)| format!("{} errors: {fix}", p.error_type))
            })
            .collect()
    }
}

/// Close out every open goal after a final answer; parents settle with their children
fn complete_all(goals: &mut GoalStack) {
    while let Some(id) = goals.activate_next() {
        if let Err(e) = goals.complete(&id) {
            warn!("Could not complete goal {id}: {e}");
            break;
        }
    }
}

fn format_observation(tool: &str, success: bool, rendered: &str, hints: &[String]) -> String {
    let verdict = if success { "succeeded" } else { "failed" };
    let mut out = format!("[{tool}] {verdict}\n{rendered}");
    for hint in hints {
        out.push_str("\nHint: ");
        out.push_str(hint);
    }
    out
}

fn rejected_report(run_id: String) -> RunReport {
    RunReport {
        run_id,
        status: RunStatus::Error,
        final_text: ALREADY_RUNNING.to_string(),
        steps: Vec::new(),
        modified_files: Vec::new(),
        iterations: 0,
        cache_hits: 0,
        plan: None,
        budget: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        let Value::Object(map) = value else {
            panic!("params must be an object");
        };
        map
    }

    #[test]
    fn test_target_path() {
        assert_eq!(target_path(&params(json!({"path": "a.rs"}))), Some("a.rs"));
        assert_eq!(target_path(&params(json!({"command": "ls"}))), None);
        assert_eq!(target_path(&params(json!({"path": ""}))), None);
    }

    #[test]
    fn test_complete_all_settles_root() {
        let mut goals = GoalStack::new();
        let root = goals.set_root("read a.txt, then summarize it", Vec::new(), None);
        goals
            .decompose(
                &root,
                vec![
                    crate::goal_stack::SubgoalSpec::new("read a.txt"),
                    crate::goal_stack::SubgoalSpec::new("summarize it"),
                ],
            )
            .unwrap();
        goals.activate_next();
        complete_all(&mut goals);
        assert!(goals.is_finished());
        assert_eq!(goals.root().unwrap().status, crate::goal_stack::GoalStatus::Completed);
        assert_eq!(goals.progress(), 1.0);
    }

    #[test]
    fn test_summary_lists_files() {
        let mut state = RunState::new("r", "bug_fix");
        state.iteration = 4;
        state.attempts = 3;
        state.successes = 2;
        state.tools_used = vec!["readFile".into(), "writeFile".into()];
        state.modified = vec!["src/lib.rs".into()];
        let text = state.summary("iteration budget exhausted");
        assert!(text.starts_with("Stopped after 4 iteration(s): iteration budget exhausted."));
        assert!(text.contains("Tool calls: 3 (2 succeeded)"));
        assert!(text.contains("Files modified: src/lib.rs"));
    }

    #[test]
    fn test_success_rate_neutral_without_calls() {
        let state = RunState::new("r", "general");
        assert_eq!(state.success_rate(), 0.5);
    }

    #[test]
    fn test_observation_carries_hints() {
        let text = format_observation("readFile", false, "Error: not found", &["try searchFiles".into()]);
        assert_eq!(text, "[readFile] failed\nError: not found\nHint: try searchFiles");
    }

    #[tokio::test]
    async fn test_auto_approver_never_approves_destructive() {
        let mut scorer = ConfidenceScorer::new().with_threshold(0.1);
        scorer.set_destructive_tools(["writeFile"]);
        for _ in 0..30 {
            scorer.record_execution(ExecutionRecord::new("writeFile", true, 5));
            scorer.record_execution(ExecutionRecord::new("readFile", true, 5));
        }
        let approver = ScorerAutoApprover::new(Arc::new(Mutex::new(scorer)));
        let request = |tool: &str| ApprovalRequest {
            tool: tool.to_string(),
            params: serde_json::Map::new(),
            description: String::new(),
            read_only: false,
        };
        assert!(!approver.auto_approve(&request("writeFile")).await);
        assert!(approver.auto_approve(&request("readFile")).await);
    }
}
