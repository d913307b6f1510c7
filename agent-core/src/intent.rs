//! Intent Classifier: maps an instruction to a task category, complexity tier,
//! iteration estimate and tool shortlist
//!
//! Rule-based and approximate. Each category carries regex patterns (weight 2)
//! and keywords (weight 1); the best aggregate score wins.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

const PATTERN_WEIGHT: u32 = 2;
const KEYWORD_WEIGHT: u32 = 1;
const MAX_CONFIDENCE: f64 = 0.95;
const DEFAULT_CONFIDENCE: f64 = 0.5;

const COMPLEX_KEYWORDS: &[&str] = &[
    "multiple", "refactor", "migrate", "migration", "redesign", "architecture", "entire",
    "across", "overhaul", "rewrite",
];
const SIMPLE_KEYWORDS: &[&str] = &["typo", "single", "quick", "small", "minor", "simple", "one-line"];
const CONFIRMATION_KEYWORDS: &[&str] = &["delete", "remove", "drop", "wipe", "force", "reset"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    CodeGeneration,
    CodeModification,
    BugFix,
    Refactoring,
    Testing,
    Documentation,
    CodeExplanation,
    Search,
    Configuration,
    GitOperation,
    ProjectSetup,
    ComplexTask,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::CodeModification => "code_modification",
            Self::BugFix => "bug_fix",
            Self::Refactoring => "refactoring",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::CodeExplanation => "code_explanation",
            Self::Search => "search",
            Self::Configuration => "configuration",
            Self::GitOperation => "git_operation",
            Self::ProjectSetup => "project_setup",
            Self::ComplexTask => "complex_task",
        }
    }

    pub fn default_tier(&self) -> ComplexityTier {
        match self {
            Self::Search => ComplexityTier::Trivial,
            Self::CodeModification
            | Self::Documentation
            | Self::CodeExplanation
            | Self::Configuration
            | Self::GitOperation => ComplexityTier::Simple,
            Self::CodeGeneration | Self::BugFix | Self::Testing | Self::ProjectSetup => {
                ComplexityTier::Moderate
            }
            Self::Refactoring | Self::ComplexTask => ComplexityTier::Complex,
        }
    }

    fn iteration_multiplier(&self) -> f64 {
        match self {
            Self::CodeGeneration => 1.2,
            Self::CodeModification => 1.0,
            Self::BugFix => 1.3,
            Self::Refactoring => 1.4,
            Self::Testing => 1.1,
            Self::Documentation => 0.8,
            Self::CodeExplanation => 0.6,
            Self::Search => 0.5,
            Self::Configuration => 0.8,
            Self::GitOperation => 0.7,
            Self::ProjectSetup => 1.2,
            Self::ComplexTask => 1.5,
        }
    }

    pub fn default_tools(&self) -> &'static [&'static str] {
        match self {
            Self::CodeGeneration => &["listDirectory", "readFile", "writeFile"],
            Self::CodeModification => &["readFile", "replaceInFile", "insertText"],
            Self::BugFix => &["readFile", "searchFiles", "replaceInFile", "runCommand"],
            Self::Refactoring => &["searchFiles", "readFile", "replaceInFile", "writeFile"],
            Self::Testing => &["readFile", "writeFile", "runCommand"],
            Self::Documentation => &["readFile", "writeFile", "replaceInFile"],
            Self::CodeExplanation => &["readFile", "searchFiles"],
            Self::Search => &["searchFiles", "listDirectory", "readFile"],
            Self::Configuration => &["readFile", "replaceInFile", "writeFile"],
            Self::GitOperation => &["runCommand"],
            Self::ProjectSetup => &["listDirectory", "runCommand", "writeFile"],
            Self::ComplexTask => &[
                "listDirectory",
                "searchFiles",
                "readFile",
                "replaceInFile",
                "writeFile",
                "runCommand",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }

    fn base_iterations(&self) -> f64 {
        match self {
            Self::Trivial => 2.0,
            Self::Simple => 4.0,
            Self::Moderate => 8.0,
            Self::Complex => 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentClassification {
    pub category: TaskCategory,
    pub confidence: f64,
    pub complexity: ComplexityTier,
    pub estimated_iterations: u32,
    pub preferred_tools: Vec<String>,
    pub requires_confirmation: bool,
    pub keywords: Vec<String>,
    pub file_references: Vec<String>,
}

/// Declarative rule before compilation
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub category: TaskCategory,
    pub patterns: Vec<String>,
    pub keywords: Vec<String>,
    pub tools: Vec<String>,
    pub complexity: Option<ComplexityTier>,
    pub requires_confirmation: bool,
}

impl RuleSpec {
    fn new(category: TaskCategory, patterns: &[&str], keywords: &[&str], tools: &[&str]) -> Self {
        Self {
            category,
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            complexity: None,
            requires_confirmation: false,
        }
    }

    fn tier(mut self, tier: ComplexityTier) -> Self {
        self.complexity = Some(tier);
        self
    }

    fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }
}

struct IntentRule {
    spec: RuleSpec,
    patterns: Vec<Regex>,
}

pub fn default_rules() -> Vec<RuleSpec> {
    use TaskCategory::*;
    vec![
        RuleSpec::new(
            BugFix,
            &[
                r"\b(fix|resolve|repair|debug)\b.*\b(bug|error|issue|crash|exception|failure|failing|panic)",
                r"\b(doesn'?t|does not|isn'?t|is not) work|\bis broken\b",
            ],
            &["bug", "error", "crash", "broken", "exception", "failing", "panic", "debug"],
            &["readFile", "searchFiles", "replaceInFile", "runCommand"],
        )
        .tier(ComplexityTier::Moderate),
        RuleSpec::new(
            CodeModification,
            &[r"\b(change|update|modify|rename|replace|fix|tweak|adjust|edit)\b"],
            &["change", "update", "modify", "rename", "edit", "typo", "tweak"],
            &["readFile", "replaceInFile", "insertText"],
        )
        .tier(ComplexityTier::Simple),
        RuleSpec::new(
            Configuration,
            &[
                r"\.(json|ya?ml|toml|ini|env|cfg|conf)\b",
                r"\b(config|configuration|settings)\b",
            ],
            &["config", "configure", "setting", "settings", "environment", "env"],
            &["readFile", "replaceInFile", "writeFile"],
        )
        .tier(ComplexityTier::Simple),
        RuleSpec::new(
            CodeGeneration,
            &[r"\b(create|write|generate|implement|add|build)\b.*\b(function|class|module|component|endpoint|file|script|feature|struct|method)"],
            &["create", "generate", "implement", "new", "scaffold"],
            &["listDirectory", "readFile", "writeFile"],
        )
        .tier(ComplexityTier::Moderate),
        RuleSpec::new(
            Refactoring,
            &[r"\brefactor", r"\b(extract|restructure|reorganize|clean ?up|simplify|deduplicate)\b"],
            &["refactor", "restructure", "extract", "cleanup", "simplify", "dedupe"],
            &["searchFiles", "readFile", "replaceInFile", "writeFile"],
        )
        .tier(ComplexityTier::Complex),
        RuleSpec::new(
            Testing,
            &[r"\b(write|add|run|fix)\b.*\btests?\b", r"\b(unit|integration|e2e|regression) tests?\b"],
            &["test", "tests", "coverage", "assert", "testing"],
            &["readFile", "writeFile", "runCommand"],
        )
        .tier(ComplexityTier::Moderate),
        RuleSpec::new(
            Documentation,
            &[r"\b(document|documentation|docs?|readme|docstrings?|changelog)\b"],
            &["documentation", "readme", "docs", "comment", "comments", "changelog"],
            &["readFile", "writeFile", "replaceInFile"],
        )
        .tier(ComplexityTier::Simple),
        RuleSpec::new(
            CodeExplanation,
            &[r"^(what|how|why)\b", r"\b(explain|what does|how does|walk me through)\b"],
            &["explain", "understand", "describe", "walkthrough", "meaning"],
            &["readFile", "searchFiles"],
        )
        .tier(ComplexityTier::Simple),
        RuleSpec::new(
            Search,
            &[r"\b(find|search|locate|grep|where is|list all)\b"],
            &["find", "search", "locate", "where", "usages", "occurrences"],
            &["searchFiles", "listDirectory", "readFile"],
        )
        .tier(ComplexityTier::Trivial),
        RuleSpec::new(
            GitOperation,
            &[r"\bgit\b", r"\b(commit|push|pull request|merge|rebase|cherry-pick|stash|checkout)\b"],
            &["commit", "branch", "merge", "rebase", "push", "diff"],
            &["runCommand"],
        )
        .tier(ComplexityTier::Simple)
        .confirm(),
        RuleSpec::new(
            ProjectSetup,
            &[
                r"\b(set ?up|initiali[sz]e|bootstrap|scaffold)\b.*\b(project|repo|repository|app|workspace)\b",
                r"\binstall\b.*\b(dependenc|packages?|deps)",
            ],
            &["setup", "install", "init", "bootstrap", "dependencies"],
            &["listDirectory", "runCommand", "writeFile"],
        )
        .tier(ComplexityTier::Moderate)
        .confirm(),
    ]
}

fn file_reference_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:[\w.-]+/)*[\w-]+\.[a-zA-Z][a-zA-Z0-9]{0,5}\b").ok())
        .as_ref()
}

/// Path-like tokens (`src/main.rs`, `config.json`) mentioned in free text
pub fn extract_file_references(text: &str) -> Vec<String> {
    let Some(re) = file_reference_regex() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|s| {
            // version numbers and sentence-ending abbreviations look like files
            !s.chars().next().is_some_and(|c| c.is_ascii_digit()) && !s.starts_with("e.g")
        })
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

fn tokens(text: &str) -> HashSet<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
        .filter(|t| !t.is_empty())
        .collect()
}

fn keyword_hit(keyword: &str, text: &str, toks: &HashSet<&str>) -> bool {
    if keyword.contains(' ') {
        text.contains(keyword)
    } else {
        toks.contains(keyword)
    }
}

pub struct IntentClassifier {
    rules: Vec<IntentRule>,
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    /// Compile rules; patterns that fail to compile are skipped with a warning
    pub fn with_rules(specs: Vec<RuleSpec>) -> Self {
        let rules = specs
            .into_iter()
            .map(|spec| {
                let patterns = spec
                    .patterns
                    .iter()
                    .filter_map(|p| match Regex::new(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(category = spec.category.as_str(), "Skipping invalid pattern {p:?}: {e}");
                            None
                        }
                    })
                    .collect();
                IntentRule { spec, patterns }
            })
            .collect();
        Self { rules }
    }

    pub fn classify(&self, instruction: &str) -> IntentClassification {
        let text = instruction.to_lowercase();
        let toks = tokens(&text);

        let mut total = 0u32;
        let mut best: Option<(usize, u32)> = None;
        let mut matched_tools: Vec<String> = Vec::new();
        let mut matched_keywords: Vec<String> = Vec::new();

        for (idx, rule) in self.rules.iter().enumerate() {
            let pattern_score = rule.patterns.iter().filter(|re| re.is_match(&text)).count() as u32
                * PATTERN_WEIGHT;
            let hits: Vec<&String> = rule
                .spec
                .keywords
                .iter()
                .filter(|k| keyword_hit(k, &text, &toks))
                .collect();
            let score = pattern_score + hits.len() as u32 * KEYWORD_WEIGHT;
            if score == 0 {
                continue;
            }
            total += score;
            for k in hits {
                if !matched_keywords.contains(k) {
                    matched_keywords.push(k.clone());
                }
            }
            for t in &rule.spec.tools {
                if !matched_tools.contains(t) {
                    matched_tools.push(t.clone());
                }
            }
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }

        let (category, confidence, rule_tier, rule_confirm) = match best {
            Some((idx, score)) => {
                let rule = &self.rules[idx].spec;
                (
                    rule.category,
                    (score as f64 / total as f64).min(MAX_CONFIDENCE),
                    rule.complexity,
                    rule.requires_confirmation,
                )
            }
            None => (TaskCategory::ComplexTask, DEFAULT_CONFIDENCE, None, false),
        };

        let complexity = if COMPLEX_KEYWORDS.iter().any(|k| keyword_hit(k, &text, &toks)) {
            ComplexityTier::Complex
        } else if SIMPLE_KEYWORDS.iter().any(|k| keyword_hit(k, &text, &toks)) {
            ComplexityTier::Simple
        } else {
            rule_tier.unwrap_or_else(|| category.default_tier())
        };

        let estimated_iterations =
            (complexity.base_iterations() * category.iteration_multiplier()).round().max(1.0) as u32;

        let preferred_tools = if matched_tools.is_empty() {
            category.default_tools().iter().map(|s| s.to_string()).collect()
        } else {
            matched_tools
        };

        let requires_confirmation =
            rule_confirm || CONFIRMATION_KEYWORDS.iter().any(|k| keyword_hit(k, &text, &toks));

        let result = IntentClassification {
            category,
            confidence,
            complexity,
            estimated_iterations,
            preferred_tools,
            requires_confirmation,
            keywords: matched_keywords,
            file_references: extract_file_references(instruction),
        };
        debug!(
            category = result.category.as_str(),
            complexity = result.complexity.as_str(),
            confidence = result.confidence,
            "Classified instruction"
        );
        result
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Heuristic classifier tests: expectations are approximate by nature.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typo_in_config() {
        let c = IntentClassifier::new().classify("fix the typo in config.json");
        assert!(matches!(
            c.category,
            TaskCategory::Configuration | TaskCategory::CodeModification
        ));
        assert!(matches!(c.complexity, ComplexityTier::Simple | ComplexityTier::Trivial));
        assert!(c.estimated_iterations <= 5);
        assert_eq!(c.file_references, vec!["config.json".to_string()]);
    }

    #[test]
    fn test_no_match_defaults() {
        let c = IntentClassifier::new().classify("zzz qqq");
        assert_eq!(c.category, TaskCategory::ComplexTask);
        assert_eq!(c.confidence, 0.5);
        assert_eq!(c.complexity, ComplexityTier::Complex);
        assert_eq!(c.preferred_tools.len(), 6);
    }

    #[test]
    fn test_complex_keyword_overrides_rule() {
        let c = IntentClassifier::new().classify("update the logging calls across multiple crates");
        assert_eq!(c.complexity, ComplexityTier::Complex);
    }

    #[test]
    fn test_bug_fix() {
        let c = IntentClassifier::new().classify("Fix the crash when parsing an empty error message");
        assert_eq!(c.category, TaskCategory::BugFix);
        assert!(c.confidence > 0.0 && c.confidence <= 0.95);
        assert!(c.preferred_tools.contains(&"runCommand".to_string()));
    }

    #[test]
    fn test_git_requires_confirmation() {
        let c = IntentClassifier::new().classify("git commit the staged changes and push");
        assert_eq!(c.category, TaskCategory::GitOperation);
        assert!(c.requires_confirmation);
    }

    #[test]
    fn test_confidence_capped() {
        let rules = vec![RuleSpec::new(TaskCategory::Search, &[r"find"], &["find"], &["searchFiles"])];
        let c = IntentClassifier::with_rules(rules).classify("find it");
        assert_eq!(c.confidence, 0.95);
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let rules = vec![RuleSpec::new(TaskCategory::Search, &[r"(unclosed", r"\bfind\b"], &[], &[])];
        let c = IntentClassifier::with_rules(rules).classify("find the handler");
        assert_eq!(c.category, TaskCategory::Search);
    }

    #[test]
    fn test_file_references() {
        let refs = extract_file_references("compare src/lib.rs with Cargo.toml and version 1.2.3");
        assert_eq!(refs, vec!["src/lib.rs".to_string(), "Cargo.toml".to_string()]);
    }
}
