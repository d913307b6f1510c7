//! Model response parsing
//!
//! A response is reduced to [`ParsedResponse`]: plain text, a proposed plan, or
//! tool calls. Tool calls are recognized by an ordered chain of strategies
//! (fenced block, tagged markup, brace scan); the first strategy that matches
//! wins and the others are not consulted.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use taskpilot_tools::{Params, ToolCall};

const NAME_KEYS: &[&str] = &["name", "tool", "tool_name", "toolName", "action"];
const PARAM_KEYS: &[&str] = &["params", "parameters", "arguments", "args", "input"];
const FENCE_LANGS: &[&str] = &["", "json", "tool", "tool_call", "tool_code", "tool_use"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedPlan {
    pub title: String,
    pub steps: Vec<String>,
}

impl ProposedPlan {
    /// Human-readable form returned to the caller for approval
    pub fn describe(&self) -> String {
        let mut out = format!("Proposed plan: {}\n", self.title);
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. {step}\n", i + 1));
        }
        out.push_str("\nApprove the plan to continue.");
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    PlainText(String),
    Plan(ProposedPlan),
    ToolCalls { calls: Vec<ToolCall>, text: String },
}

/// Result of a single strategy: a definite match or a pass-through
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Matched { calls: Vec<ToolCall>, remaining: String },
    Pass,
}

pub trait ToolCallStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> StrategyOutcome;
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn thinking_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)<(?:think|thinking)>(.*?)</(?:think|thinking)>")
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)```[ \t]*([A-Za-z_]*)[ \t]*\r?\n(.*?)```")
}

fn tool_call_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)<tool_call>\s*(.*?)\s*</tool_call>")
}

fn named_tool_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"(?s)<tool\s+name\s*=\s*"([^"]+)"\s*>(.*?)</tool>"#)
}

fn plan_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"(?s)<plan(?:\s+title\s*=\s*"([^"]*)")?\s*>(.*?)</plan>"#)
}

fn list_marker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"^\s*(?:\d+[.)]|[-*•])\s*")
}

/// Split out `<thinking>` blocks. Returns the reasoning (if any) and the rest.
pub fn extract_thinking(text: &str) -> (Option<String>, String) {
    let Some(re) = thinking_regex() else {
        return (None, text.to_string());
    };
    let thoughts: Vec<String> = re
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let rest = re.replace_all(text, "").trim().to_string();
    if thoughts.is_empty() {
        (None, rest)
    } else {
        (Some(thoughts.join("\n\n")), rest)
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Byte ranges and values of every balanced top-level JSON object in `text`
fn scan_json_objects(text: &str) -> Vec<(usize, usize, Value)> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        match matching_brace(bytes, i) {
            Some(end) => match serde_json::from_str::<Value>(&text[i..=end]) {
                Ok(v @ Value::Object(_)) => {
                    found.push((i, end + 1, v));
                    i = end + 1;
                }
                _ => i += 1,
            },
            None => i += 1,
        }
    }
    found
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn params_from(value: &Value) -> Option<Params> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        Value::Null => Some(Params::new()),
        _ => None,
    }
}

/// Interpret a JSON value as zero or more tool calls. With `strict`, a bare
/// `{"name": ...}` object only counts when it also carries parameters.
fn calls_from_value(value: &Value, strict: bool) -> Vec<ToolCall> {
    match value {
        Value::Array(items) => items.iter().flat_map(|v| calls_from_value(v, strict)).collect(),
        Value::Object(map) => {
            for list_key in ["tool_calls", "calls", "tools"] {
                if let Some(Value::Array(items)) = map.get(list_key) {
                    return items.iter().flat_map(|v| calls_from_value(v, false)).collect();
                }
            }

            // OpenAI style: {"function": {"name": ..., "arguments": "{...}"}}
            if let Some(Value::Object(func)) = map.get("function") {
                if let Some(name) = func.get("name").and_then(Value::as_str) {
                    let params = PARAM_KEYS
                        .iter()
                        .find_map(|k| func.get(*k))
                        .and_then(params_from)
                        .unwrap_or_default();
                    return vec![ToolCall::new(name, params)];
                }
            }

            let Some((name_key, name)) = NAME_KEYS
                .iter()
                .chain(std::iter::once(&"function"))
                .find_map(|k| map.get(*k).and_then(Value::as_str).map(|n| (*k, n)))
            else {
                return Vec::new();
            };
            if name.trim().is_empty() {
                return Vec::new();
            }
            let param_value = PARAM_KEYS.iter().find_map(|k| map.get(*k));
            if strict && param_value.is_none() && name_key == "name" {
                return Vec::new();
            }
            match param_value {
                Some(v) => match params_from(v) {
                    Some(params) => vec![ToolCall::new(name.trim(), params)],
                    None => Vec::new(),
                },
                None => vec![ToolCall::new(name.trim(), Params::new())],
            }
        }
        _ => Vec::new(),
    }
}

fn remove_spans(text: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for &(start, end) in spans {
        if start >= cursor {
            out.push_str(&text[cursor..start]);
            cursor = end;
        }
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// ```json { "name": ..., "params": {...} } ```
pub struct FencedBlockStrategy;

impl ToolCallStrategy for FencedBlockStrategy {
    fn name(&self) -> &'static str {
        "fenced_block"
    }

    fn extract(&self, text: &str) -> StrategyOutcome {
        let Some(re) = fence_regex() else {
            return StrategyOutcome::Pass;
        };
        let mut calls = Vec::new();
        let mut spans = Vec::new();
        for cap in re.captures_iter(text) {
            let lang = cap.get(1).map_or("", |m| m.as_str()).to_lowercase();
            if !FENCE_LANGS.contains(&lang.as_str()) {
                continue;
            }
            let (Some(whole), Some(body)) = (cap.get(0), cap.get(2)) else {
                continue;
            };
            let found = match serde_json::from_str::<Value>(body.as_str().trim()) {
                Ok(v) => calls_from_value(&v, false),
                Err(_) => scan_json_objects(body.as_str())
                    .iter()
                    .flat_map(|(_, _, v)| calls_from_value(v, false))
                    .collect(),
            };
            if !found.is_empty() {
                calls.extend(found);
                spans.push((whole.start(), whole.end()));
            }
        }
        if calls.is_empty() {
            StrategyOutcome::Pass
        } else {
            StrategyOutcome::Matched {
                calls,
                remaining: remove_spans(text, &spans),
            }
        }
    }
}

/// `<tool_call>{...}</tool_call>` or `<tool name="readFile">{...}</tool>`
pub struct TaggedMarkupStrategy;

impl ToolCallStrategy for TaggedMarkupStrategy {
    fn name(&self) -> &'static str {
        "tagged_markup"
    }

    fn extract(&self, text: &str) -> StrategyOutcome {
        let mut found: Vec<(usize, usize, Vec<ToolCall>)> = Vec::new();

        if let Some(re) = tool_call_tag_regex() {
            for cap in re.captures_iter(text) {
                let (Some(whole), Some(body)) = (cap.get(0), cap.get(1)) else {
                    continue;
                };
                if let Ok(v) = serde_json::from_str::<Value>(body.as_str()) {
                    let calls = calls_from_value(&v, false);
                    if !calls.is_empty() {
                        found.push((whole.start(), whole.end(), calls));
                    }
                }
            }
        }

        if let Some(re) = named_tool_tag_regex() {
            for cap in re.captures_iter(text) {
                let (Some(whole), Some(name), Some(body)) = (cap.get(0), cap.get(1), cap.get(2)) else {
                    continue;
                };
                let body = body.as_str().trim();
                let params = if body.is_empty() {
                    Some(Params::new())
                } else {
                    match serde_json::from_str::<Value>(body) {
                        Ok(v) => params_from(&v),
                        Err(_) => None,
                    }
                };
                if let Some(params) = params {
                    found.push((whole.start(), whole.end(), vec![ToolCall::new(name.as_str(), params)]));
                }
            }
        }

        if found.is_empty() {
            return StrategyOutcome::Pass;
        }
        found.sort_by_key(|(start, _, _)| *start);
        let spans: Vec<(usize, usize)> = found.iter().map(|(s, e, _)| (*s, *e)).collect();
        StrategyOutcome::Matched {
            calls: found.into_iter().flat_map(|(_, _, c)| c).collect(),
            remaining: remove_spans(text, &spans),
        }
    }
}

/// Any balanced JSON object in the prose that looks like a tool call
pub struct BraceScanStrategy;

impl ToolCallStrategy for BraceScanStrategy {
    fn name(&self) -> &'static str {
        "brace_scan"
    }

    fn extract(&self, text: &str) -> StrategyOutcome {
        let mut calls = Vec::new();
        let mut spans = Vec::new();
        for (start, end, value) in scan_json_objects(text) {
            let found = calls_from_value(&value, true);
            if !found.is_empty() {
                calls.extend(found);
                spans.push((start, end));
            }
        }
        if calls.is_empty() {
            StrategyOutcome::Pass
        } else {
            StrategyOutcome::Matched {
                calls,
                remaining: remove_spans(text, &spans),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

fn plan_from_value(value: &Value) -> Option<ProposedPlan> {
    let obj = value.as_object()?;
    if let Some(inner @ Value::Object(_)) = obj.get("plan") {
        return plan_from_value(inner);
    }
    let title = obj.get("title").and_then(Value::as_str)?.trim().to_string();
    let steps: Vec<String> = obj
        .get("steps")?
        .as_array()?
        .iter()
        .filter_map(|s| match s {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(o) => ["description", "title", "step"]
                .iter()
                .find_map(|k| o.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect();
    if title.is_empty() || steps.is_empty() {
        return None;
    }
    Some(ProposedPlan { title, steps })
}

/// A structured plan (title + ordered steps), in JSON or `<plan>` markup
pub fn extract_plan(text: &str) -> Option<ProposedPlan> {
    if let Some(re) = plan_tag_regex() {
        if let Some(cap) = re.captures(text) {
            let body = cap.get(2).map_or("", |m| m.as_str());
            if let Ok(v) = serde_json::from_str::<Value>(body.trim()) {
                if let Some(plan) = plan_from_value(&v) {
                    return Some(plan);
                }
            }
            let steps: Vec<String> = body
                .lines()
                .map(|l| match list_marker_regex() {
                    Some(m) => m.replace(l, "").trim().to_string(),
                    None => l.trim().to_string(),
                })
                .filter(|l| !l.is_empty())
                .collect();
            if !steps.is_empty() {
                let title = cap
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "Plan".to_string());
                return Some(ProposedPlan { title, steps });
            }
        }
    }
    scan_json_objects(text)
        .iter()
        .find_map(|(_, _, v)| plan_from_value(v))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

pub struct ResponseParser {
    strategies: Vec<Box<dyn ToolCallStrategy>>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(FencedBlockStrategy),
                Box::new(TaggedMarkupStrategy),
                Box::new(BraceScanStrategy),
            ],
        }
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ToolCallStrategy>>) -> Self {
        Self { strategies }
    }

    /// Parse a response whose thinking blocks were already removed
    pub fn parse(&self, text: &str, detect_plan: bool) -> ParsedResponse {
        if detect_plan {
            if let Some(plan) = extract_plan(text) {
                return ParsedResponse::Plan(plan);
            }
        }
        for strategy in &self.strategies {
            if let StrategyOutcome::Matched { calls, remaining } = strategy.extract(text) {
                debug!(strategy = strategy.name(), calls = calls.len(), "Parsed tool calls");
                return ParsedResponse::ToolCalls {
                    calls,
                    text: remaining,
                };
            }
        }
        ParsedResponse::PlainText(text.trim().to_string())
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}
