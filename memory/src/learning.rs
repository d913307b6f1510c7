//! Learning store: (error → attempted fix → outcome) records
//!
//! Records are clustered into [`ErrorPattern`]s by normalized error signature.
//! History is bounded; patterns keep aggregate counts after their records are evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

const SIGNATURE_MAX_LEN: usize = 200;
const MAX_SOLUTIONS_PER_PATTERN: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    pub max_history: usize,
    pub similarity_threshold: f64,
    pub min_similar_corrections: usize,
    pub min_alternative_success_rate: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            max_history: 500,
            similarity_threshold: 0.7,
            min_similar_corrections: 3,
            min_alternative_success_rate: 0.6,
        }
    }
}

/// Optional filters narrowing similarity matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionContext {
    pub language: Option<String>,
    pub file_type: Option<String>,
}

impl CorrectionContext {
    pub fn for_path(path: &str) -> Self {
        let ext = std::path::Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        Self {
            language: ext.as_deref().and_then(language_for_extension).map(str::to_string),
            file_type: ext,
        }
    }

    fn matches(&self, record: &CorrectionRecord) -> bool {
        let lang_ok = self.language.is_none() || self.language == record.context.language;
        let type_ok = self.file_type.is_none() || self.file_type == record.context.file_type;
        lang_ok && type_ok
    }
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "json" | "toml" | "yaml" | "yml" => "config",
        "md" => "markdown",
        _ => return None,
    })
}

/// Input to [`LearningStore::record_correction`]
#[derive(Debug, Clone, Default)]
pub struct NewCorrection {
    pub error_type: String,
    pub error_message: String,
    pub tool: String,
    pub fix_description: String,
    pub success: bool,
    pub context: CorrectionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub id: String,
    pub signature: String,
    pub error_type: String,
    pub error_message: String,
    pub tool: String,
    pub fix_description: String,
    pub success: bool,
    pub context: CorrectionContext,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcomeStats {
    pub attempts: u64,
    pub successes: u64,
}

impl ToolOutcomeStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub signature: String,
    pub error_type: String,
    pub frequency: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub tool_stats: HashMap<String, ToolOutcomeStats>,
    /// Successful fixes, most frequent first
    pub solutions: Vec<(String, u64)>,
    pub last_seen: DateTime<Utc>,
}

impl ErrorPattern {
    fn new(signature: &str, error_type: &str) -> Self {
        Self {
            signature: signature.to_string(),
            error_type: error_type.to_string(),
            frequency: 0,
            successes: 0,
            success_rate: 0.0,
            tool_stats: HashMap::new(),
            solutions: Vec::new(),
            last_seen: Utc::now(),
        }
    }

    fn absorb(&mut self, record: &CorrectionRecord) {
        self.frequency += 1;
        if record.success {
            self.successes += 1;
        }
        self.success_rate = self.successes as f64 / self.frequency as f64;
        self.last_seen = record.timestamp;

        let stats = self.tool_stats.entry(record.tool.clone()).or_default();
        stats.attempts += 1;
        if record.success {
            stats.successes += 1;
        }

        if record.success && !record.fix_description.is_empty() {
            match self
                .solutions
                .iter_mut()
                .find(|(fix, _)| *fix == record.fix_description)
            {
                Some((_, count)) => *count += 1,
                None => self.solutions.push((record.fix_description.clone(), 1)),
            }
            self.solutions.sort_by(|a, b| b.1.cmp(&a.1));
            self.solutions.truncate(MAX_SOLUTIONS_PER_PATTERN);
        }
    }

    /// Tools ranked by observed success rate
    pub fn ranked_tools(&self) -> Vec<(String, f64)> {
        let mut tools: Vec<(String, f64)> = self
            .tool_stats
            .iter()
            .map(|(t, s)| (t.clone(), s.success_rate()))
            .collect();
        tools.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tools
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarCorrection {
    pub record: CorrectionRecord,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecommendation {
    pub tool: String,
    pub success_rate: f64,
    pub current_success_rate: f64,
    pub evidence: usize,
}

/// Clustering key for an error: lowercase, unquoted, digit-free, single-spaced, bounded
pub fn normalize_error_signature(error_type: &str, message: &str) -> String {
    let raw = format!("{error_type}: {message}").to_lowercase();
    let mut out = String::with_capacity(raw.len());
    let mut last_was_digit = false;
    let mut last_was_space = false;

    for c in raw.chars() {
        if matches!(c, '"' | '\'' | '`') {
            continue;
        }
        if c.is_ascii_digit() {
            if !last_was_digit {
                out.push('N');
            }
            last_was_digit = true;
            last_was_space = false;
            continue;
        }
        last_was_digit = false;
        if c.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        out.push(c);
    }

    let trimmed = out.trim_end();
    trimmed.chars().take(SIGNATURE_MAX_LEN).collect()
}

pub struct LearningStore {
    history: VecDeque<CorrectionRecord>,
    patterns: HashMap<String, ErrorPattern>,
    config: LearningConfig,
}

impl LearningStore {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.max_history.min(1024)),
            patterns: HashMap::new(),
            config,
        }
    }

    pub fn record_correction(&mut self, input: NewCorrection) -> String {
        let signature = normalize_error_signature(&input.error_type, &input.error_message);
        let record = CorrectionRecord {
            id: Uuid::new_v4().to_string(),
            signature: signature.clone(),
            error_type: input.error_type,
            error_message: input.error_message,
            tool: input.tool,
            fix_description: input.fix_description,
            success: input.success,
            context: input.context,
            timestamp: Utc::now(),
        };

        self.patterns
            .entry(signature.clone())
            .or_insert_with(|| ErrorPattern::new(&signature, &record.error_type))
            .absorb(&record);

        debug!(
            tool = %record.tool,
            success = record.success,
            "Recorded correction for '{signature}'"
        );

        let id = record.id.clone();
        self.push(record);
        id
    }

    fn push(&mut self, record: CorrectionRecord) {
        while self.history.len() >= self.config.max_history.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn history(&self) -> impl Iterator<Item = &CorrectionRecord> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn pattern(&self, error_type: &str, message: &str) -> Option<&ErrorPattern> {
        self.patterns
            .get(&normalize_error_signature(error_type, message))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &ErrorPattern> {
        self.patterns.values()
    }

    /// Past corrections whose signature similarity exceeds the threshold, most similar first
    pub fn find_similar_corrections(
        &self,
        error_type: &str,
        message: &str,
        context: Option<&CorrectionContext>,
    ) -> Vec<SimilarCorrection> {
        let signature = normalize_error_signature(error_type, message);
        let mut out: Vec<SimilarCorrection> = self
            .history
            .iter()
            .filter(|r| context.map_or(true, |c| c.matches(r)))
            .filter_map(|r| {
                let similarity = strsim::normalized_levenshtein(&signature, &r.signature);
                (similarity > self.config.similarity_threshold).then(|| SimilarCorrection {
                    record: r.clone(),
                    similarity,
                })
            })
            .collect();
        out.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        out
    }

    /// Propose a different tool when similar past errors show it doing clearly better
    pub fn get_adaptive_tool_selection(
        &self,
        error_type: &str,
        message: &str,
        current_tool: &str,
        context: Option<&CorrectionContext>,
    ) -> Option<ToolRecommendation> {
        let similar = self.find_similar_corrections(error_type, message, context);
        if similar.len() < self.config.min_similar_corrections {
            return None;
        }

        let mut stats: HashMap<&str, ToolOutcomeStats> = HashMap::new();
        for s in &similar {
            let entry = stats.entry(s.record.tool.as_str()).or_default();
            entry.attempts += 1;
            if s.record.success {
                entry.successes += 1;
            }
        }

        let current_rate = stats.get(current_tool).map_or(0.0, |s| s.success_rate());
        let (best_tool, best) = stats
            .iter()
            .filter(|(tool, _)| **tool != current_tool)
            .max_by(|a, b| {
                a.1.success_rate()
                    .total_cmp(&b.1.success_rate())
                    .then_with(|| a.1.attempts.cmp(&b.1.attempts))
                    .then_with(|| b.0.cmp(a.0))
            })?;

        let rate = best.success_rate();
        if rate <= self.config.min_alternative_success_rate || rate <= current_rate {
            return None;
        }

        info!(
            "Suggesting {best_tool} over {current_tool} ({:.0}% vs {:.0}% on {} similar errors)",
            rate * 100.0,
            current_rate * 100.0,
            similar.len()
        );
        Some(ToolRecommendation {
            tool: best_tool.to_string(),
            success_rate: rate,
            current_success_rate: current_rate,
            evidence: similar.len(),
        })
    }

    /// Most frequent successful fixes recorded for this exact error signature
    pub fn suggested_solutions(&self, error_type: &str, message: &str, limit: usize) -> Vec<String> {
        self.pattern(error_type, message)
            .map(|p| p.solutions.iter().take(limit).map(|(s, _)| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> (Vec<CorrectionRecord>, Vec<ErrorPattern>) {
        (
            self.history.iter().cloned().collect(),
            self.patterns.values().cloned().collect(),
        )
    }

    /// Replace state with persisted records and patterns
    pub fn restore(&mut self, records: Vec<CorrectionRecord>, patterns: Vec<ErrorPattern>) {
        self.history.clear();
        for r in records {
            self.push(r);
        }
        self.patterns = patterns
            .into_iter()
            .map(|p| (p.signature.clone(), p))
            .collect();
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.patterns.clear();
    }
}

impl Default for LearningStore {
    fn default() -> Self {
        Self::new(LearningConfig::default())
    }
}
