//! Context assembly and context-window management
//!
//! Builds the system prompt for a run and keeps the transcript inside the
//! model's context window:
//! 1. the system prompt is always retained
//! 2. oldest non-system messages are dropped first
//! 3. if still too large, the oldest retained message is hard-truncated

use std::path::Path;
use tracing::debug;

use taskpilot_tools::ToolDefinition;

use crate::inference::{Message, Role};
use crate::intent::IntentClassification;

const TRUNCATION_MARKER: &str = "[earlier content truncated]\n";

/// Inputs for the system prompt
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub workspace_root: &'a Path,
    pub tools: &'a [ToolDefinition],
    pub intent: Option<&'a IntentClassification>,
    /// Suggested breakdown of the task, in order
    pub subgoals: &'a [String],
    pub plan_mode: bool,
    /// Fixes that worked for similar errors before
    pub learned_hints: &'a [String],
}

/// Assembled context for a run
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prompt: String,
    pub hints_used: usize,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub dropped: usize,
    pub truncated: bool,
}

pub struct ContextAssembler {
    max_context_tokens: usize,
}

impl ContextAssembler {
    pub fn new(max_context_tokens: usize) -> Self {
        Self { max_context_tokens }
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    /// Build the system prompt; learned hints are included while they fit in
    /// a quarter of the window
    pub fn assemble(&self, inputs: &PromptInputs<'_>) -> AssembledContext {
        let hint_budget = self.max_context_tokens / 4;
        let mut hint_tokens = 0;
        let mut hints = Vec::new();
        for hint in inputs.learned_hints {
            let tokens = estimate_tokens(hint);
            if hint_tokens + tokens > hint_budget {
                break;
            }
            hint_tokens += tokens;
            hints.push(hint.as_str());
        }

        let system_prompt = build_system_prompt(inputs, &hints);
        let estimated_tokens = estimate_tokens(&system_prompt);
        debug!(
            "Assembled context: {} tools, {} hints, ~{} tokens",
            inputs.tools.len(),
            hints.len(),
            estimated_tokens
        );
        AssembledContext {
            system_prompt,
            hints_used: hints.len(),
            estimated_tokens,
        }
    }

    /// Fit `messages` into the window in place
    pub fn trim(&self, messages: &mut Vec<Message>) -> TrimReport {
        trim_to_budget(messages, self.max_context_tokens)
    }
}

fn build_system_prompt(inputs: &PromptInputs<'_>, hints: &[&str]) -> String {
    let mut prompt = format!(
        "You are taskpilot, an autonomous coding agent working inside the workspace at {}.\n\
         Complete the user's task by calling tools, observing their results, and continuing \
         until the task is done. All relative paths resolve against the workspace.\n\n",
        inputs.workspace_root.display()
    );

    prompt.push_str("## Tools\n");
    if inputs.tools.is_empty() {
        prompt.push_str("No tools are available. Answer directly.\n");
    } else {
        for def in inputs.tools {
            prompt.push_str("- ");
            prompt.push_str(&def.usage());
            prompt.push('\n');
        }
    }

    prompt.push_str(
        "\n## Calling tools\n\
         To call tools, reply with one fenced JSON block per call:\n\
         ```json\n{\"name\": \"readFile\", \"params\": {\"path\": \"src/main.rs\"}}\n```\n\
         Several calls in one reply run in order. Put private reasoning inside \
         <thinking>...</thinking>. When the task is complete, reply with a plain-text \
         summary and no tool calls.\n",
    );

    if inputs.plan_mode {
        prompt.push_str(
            "\n## Plan mode\n\
             Before changing anything, propose a plan as JSON: \
             {\"plan\": {\"title\": \"...\", \"steps\": [\"...\"]}}. \
             Read-only tools may be used to gather context first.\n",
        );
    }

    if let Some(intent) = inputs.intent {
        prompt.push_str(&format!(
            "\n## Task profile\nCategory: {}\nEstimated complexity: {}\nSuggested tools: {}\n",
            intent.category.as_str(),
            intent.complexity.as_str(),
            intent.preferred_tools.join(", ")
        ));
    }

    if !inputs.subgoals.is_empty() {
        prompt.push_str("\n## Suggested steps\n");
        for (i, step) in inputs.subgoals.iter().enumerate() {
            prompt.push_str(&format!("{}. {step}\n", i + 1));
        }
        prompt.push_str("Work through them with tools and give one final summary at the end.\n");
    }

    if !hints.is_empty() {
        prompt.push_str("\n## What worked before\n");
        for hint in hints {
            prompt.push_str("- ");
            prompt.push_str(hint);
            prompt.push('\n');
        }
    }

    prompt
}

/// Rough token estimation (4 chars per token)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Drop, then truncate, non-system messages until the transcript fits. The
/// system prompt and the newest message are never dropped.
pub fn trim_to_budget(messages: &mut Vec<Message>, max_tokens: usize) -> TrimReport {
    let mut report = TrimReport::default();
    let first_movable = usize::from(messages.first().is_some_and(|m| m.role == Role::System));

    while estimate_messages(messages) > max_tokens && messages.len() > first_movable + 1 {
        messages.remove(first_movable);
        report.dropped += 1;
    }

    let total = estimate_messages(messages);
    if total > max_tokens && messages.len() > first_movable {
        let target = &mut messages[first_movable];
        let others = total - estimate_tokens(&target.content);
        let allowed_chars = max_tokens.saturating_sub(others).saturating_mul(4);
        let keep = allowed_chars.saturating_sub(TRUNCATION_MARKER.len());
        let chars: Vec<char> = target.content.chars().collect();
        let tail: String = chars[chars.len().saturating_sub(keep)..].iter().collect();
        target.content = format!("{TRUNCATION_MARKER}{tail}");
        report.truncated = true;
    }

    if report.dropped > 0 || report.truncated {
        debug!(dropped = report.dropped, truncated = report.truncated, "Trimmed transcript");
    }
    report
}

/// Cap a single tool result before it is folded into the transcript
pub fn truncate_tool_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}\n[... truncated {} chars]", total - max_chars)
}
