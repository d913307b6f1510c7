//! Confidence Scorer: per-tool historical performance and 0-1 confidence
//!
//! Statistics accumulate across runs. Scores feed tool ranking and the
//! auto-approval hook in front of the permission callback.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Uses needed before raw success rate is trusted fully
pub const FULL_CONFIDENCE_USES: u64 = 20;
/// Below this many uses a score is neutral rather than extrapolated
pub const MIN_USES_FOR_SCORE: u64 = 3;
pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f64 = 0.8;

const RECENT_WINDOW: usize = 20;
const MAX_CANCELLATION_PENALTY: f64 = 0.3;

const WEIGHT_SUCCESS: f64 = 0.4;
const WEIGHT_CONTEXT: f64 = 0.3;
const WEIGHT_DURATION: f64 = 0.2;
const WEIGHT_RECENCY: f64 = 0.1;

/// Name fragments treated as destructive even if never registered as such
const DESTRUCTIVE_FRAGMENTS: &[&str] = &[
    "write", "delete", "remove", "replace", "insert", "command", "exec", "move", "rename",
];

/// One completed tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub tool: String,
    pub success: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
    pub file_extension: Option<String>,
    pub task_category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(tool: &str, success: bool, duration_ms: u64) -> Self {
        Self {
            tool: tool.to_string(),
            success,
            cancelled: false,
            duration_ms,
            file_extension: None,
            task_category: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPerformance {
    pub tool_name: String,
    pub total_uses: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub avg_duration_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub confidence: f64,
}

impl ToolPerformance {
    fn new(tool: &str) -> Self {
        Self {
            tool_name: tool.to_string(),
            total_uses: 0,
            successes: 0,
            failures: 0,
            cancellations: 0,
            avg_duration_ms: 0.0,
            last_used: None,
            success_rate: 0.0,
            confidence: 0.5,
        }
    }

    fn apply(&mut self, record: &ExecutionRecord) {
        self.total_uses += 1;
        if record.cancelled {
            self.cancellations += 1;
        } else if record.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let n = self.total_uses as f64;
        self.avg_duration_ms += (record.duration_ms as f64 - self.avg_duration_ms) / n;
        self.last_used = Some(record.timestamp);
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.total_uses == 0 {
            self.success_rate = 0.0;
            self.confidence = 0.5;
            return;
        }
        let uses = self.total_uses as f64;
        self.success_rate = self.successes as f64 / uses;

        let mut confidence = self.success_rate;
        if self.total_uses < FULL_CONFIDENCE_USES {
            let weight = uses / FULL_CONFIDENCE_USES as f64;
            confidence = 0.5 + (confidence - 0.5) * weight;
        }
        let cancel_rate = self.cancellations as f64 / uses;
        confidence *= 1.0 - MAX_CANCELLATION_PENALTY * cancel_rate;
        self.confidence = confidence.clamp(0.1, 0.95);
    }
}

/// What the candidate call is about to touch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfidenceContext {
    pub file_extension: Option<String>,
    pub task_category: Option<String>,
}

impl ConfidenceContext {
    pub fn for_path(path: Option<&str>, task_category: Option<&str>) -> Self {
        Self {
            file_extension: path
                .and_then(|p| std::path::Path::new(p).extension())
                .map(|e| e.to_string_lossy().to_lowercase()),
            task_category: task_category.map(str::to_string),
        }
    }

    fn is_empty(&self) -> bool {
        self.file_extension.is_none() && self.task_category.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    High,
    Moderate,
    Low,
    VeryLow,
}

impl Recommendation {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Recommendation::High
        } else if score >= 0.6 {
            Recommendation::Moderate
        } else if score >= 0.4 {
            Recommendation::Low
        } else {
            Recommendation::VeryLow
        }
    }

    pub fn is_recommended(&self) -> bool {
        matches!(self, Recommendation::High | Recommendation::Moderate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceFactors {
    pub success_rate: f64,
    pub contextual: f64,
    pub duration: f64,
    pub recency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceScore {
    pub tool: String,
    pub score: f64,
    pub recommendation: Recommendation,
    pub recommended: bool,
    pub sample_size: u64,
    pub factors: Option<ConfidenceFactors>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveSuggestion {
    pub tool: String,
    pub score: f64,
    pub improvement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoApproveDecision {
    pub approved: bool,
    pub score: f64,
    pub reason: String,
}

fn duration_factor(avg_ms: f64) -> f64 {
    match avg_ms {
        d if d < 1_000.0 => 1.0,
        d if d < 5_000.0 => 0.9,
        d if d < 15_000.0 => 0.75,
        d if d < 60_000.0 => 0.6,
        _ => 0.5,
    }
}

fn recency_factor(last_used: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last) = last_used else {
        return 0.6;
    };
    let age = now - last;
    if age < Duration::hours(1) {
        1.0
    } else if age < Duration::hours(24) {
        0.9
    } else if age < Duration::days(7) {
        0.8
    } else if age < Duration::days(30) {
        0.7
    } else {
        0.6
    }
}

pub fn looks_destructive(tool: &str) -> bool {
    let lower = tool.to_lowercase();
    DESTRUCTIVE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

pub struct ConfidenceScorer {
    performance: HashMap<String, ToolPerformance>,
    recent: HashMap<String, VecDeque<ExecutionRecord>>,
    destructive: HashSet<String>,
    auto_approve_threshold: f64,
}

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self {
            performance: HashMap::new(),
            recent: HashMap::new(),
            destructive: HashSet::new(),
            auto_approve_threshold: DEFAULT_AUTO_APPROVE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.auto_approve_threshold = threshold;
        self
    }

    /// Register names that must never be auto-approved
    pub fn set_destructive_tools<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destructive.extend(names.into_iter().map(Into::into));
    }

    pub fn is_destructive(&self, tool: &str) -> bool {
        self.destructive.contains(tool) || looks_destructive(tool)
    }

    /// Fold one execution into the tool's statistics
    pub fn record_execution(&mut self, record: ExecutionRecord) {
        let perf = self
            .performance
            .entry(record.tool.clone())
            .or_insert_with(|| ToolPerformance::new(&record.tool));
        perf.apply(&record);
        debug!(
            tool = %record.tool,
            uses = perf.total_uses,
            confidence = perf.confidence,
            "Recorded tool execution"
        );

        let recent = self.recent.entry(record.tool.clone()).or_default();
        if recent.len() >= RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    pub fn performance(&self, tool: &str) -> Option<&ToolPerformance> {
        self.performance.get(tool)
    }

    pub fn calculate_confidence(&self, tool: &str, ctx: &ConfidenceContext) -> ConfidenceScore {
        self.calculate_confidence_at(tool, ctx, Utc::now())
    }

    pub fn calculate_confidence_at(
        &self,
        tool: &str,
        ctx: &ConfidenceContext,
        now: DateTime<Utc>,
    ) -> ConfidenceScore {
        let uses = self.performance.get(tool).map_or(0, |p| p.total_uses);
        let perf = match self.performance.get(tool) {
            Some(p) if p.total_uses >= MIN_USES_FOR_SCORE => p,
            _ => {
                return ConfidenceScore {
                    tool: tool.to_string(),
                    score: 0.5,
                    recommendation: Recommendation::Moderate,
                    recommended: true,
                    sample_size: uses,
                    factors: None,
                }
            }
        };

        let factors = ConfidenceFactors {
            success_rate: perf.success_rate,
            contextual: self.contextual_factor(tool, ctx),
            duration: duration_factor(perf.avg_duration_ms),
            recency: recency_factor(perf.last_used, now),
        };
        let score = (WEIGHT_SUCCESS * factors.success_rate
            + WEIGHT_CONTEXT * factors.contextual
            + WEIGHT_DURATION * factors.duration
            + WEIGHT_RECENCY * factors.recency)
            .clamp(0.0, 1.0);
        let recommendation = Recommendation::from_score(score);

        ConfidenceScore {
            tool: tool.to_string(),
            score,
            recommendation,
            recommended: recommendation.is_recommended(),
            sample_size: perf.total_uses,
            factors: Some(factors),
        }
    }

    /// Success share of recent invocations that overlap the context; 0.5 when none do
    fn contextual_factor(&self, tool: &str, ctx: &ConfidenceContext) -> f64 {
        if ctx.is_empty() {
            return 0.5;
        }
        let Some(recent) = self.recent.get(tool) else {
            return 0.5;
        };
        let relevant: Vec<&ExecutionRecord> = recent
            .iter()
            .filter(|r| {
                (ctx.file_extension.is_some() && r.file_extension == ctx.file_extension)
                    || (ctx.task_category.is_some() && r.task_category == ctx.task_category)
            })
            .collect();
        if relevant.is_empty() {
            return 0.5;
        }
        relevant.iter().filter(|r| r.success).count() as f64 / relevant.len() as f64
    }

    /// Highest-scoring candidate
    pub fn get_best_tool(&self, candidates: &[&str], ctx: &ConfidenceContext) -> Option<ConfidenceScore> {
        candidates
            .iter()
            .map(|t| self.calculate_confidence(t, ctx))
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }

    /// Alternatives scoring meaningfully above the current tool, best first
    pub fn get_adaptive_suggestions(
        &self,
        current: &str,
        alternatives: &[&str],
        ctx: &ConfidenceContext,
    ) -> Vec<AdaptiveSuggestion> {
        let base = self.calculate_confidence(current, ctx).score;
        let mut out: Vec<AdaptiveSuggestion> = alternatives
            .iter()
            .filter(|t| **t != current)
            .map(|t| self.calculate_confidence(t, ctx))
            .filter(|s| s.sample_size >= MIN_USES_FOR_SCORE && s.score > base + 0.1)
            .map(|s| AdaptiveSuggestion {
                improvement: s.score - base,
                tool: s.tool,
                score: s.score,
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out
    }

    pub fn should_auto_approve(&self, tool: &str, ctx: &ConfidenceContext) -> AutoApproveDecision {
        if self.is_destructive(tool) {
            return AutoApproveDecision {
                approved: false,
                score: 0.0,
                reason: format!("{tool} is destructive and always needs confirmation"),
            };
        }
        let score = self.calculate_confidence(tool, ctx);
        let approved = score.score >= self.auto_approve_threshold && score.recommended;
        AutoApproveDecision {
            approved,
            score: score.score,
            reason: if approved {
                format!("confidence {:.2} meets threshold {:.2}", score.score, self.auto_approve_threshold)
            } else {
                format!("confidence {:.2} below threshold {:.2}", score.score, self.auto_approve_threshold)
            },
        }
    }

    /// Performance records for persistence, sorted by tool name
    pub fn snapshot(&self) -> Vec<ToolPerformance> {
        let mut perfs: Vec<ToolPerformance> = self.performance.values().cloned().collect();
        perfs.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        perfs
    }

    pub fn restore(&mut self, records: Vec<ToolPerformance>) {
        for mut perf in records {
            perf.recompute();
            self.performance.insert(perf.tool_name.clone(), perf);
        }
    }

    pub fn reset(&mut self) {
        self.performance.clear();
        self.recent.clear();
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new()
    }
}
