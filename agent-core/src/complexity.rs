//! Complexity Estimator: five-factor score for a task description

use serde::{Deserialize, Serialize};

use crate::intent::{extract_file_references, ComplexityTier, IntentClassification};

const SCOPE_WEIGHT: f64 = 0.25;
const UNCERTAINTY_WEIGHT: f64 = 0.25;
const DEPENDENCY_WEIGHT: f64 = 0.2;
const RISK_WEIGHT: f64 = 0.2;
const NOVELTY_WEIGHT: f64 = 0.1;

const UNCERTAINTY_MULTIPLIER: f64 = 1.5;
const RISK_MULTIPLIER: f64 = 1.3;
const HIGH_FACTOR: u32 = 7;

const BROAD_SCOPE: &[&str] = &[
    "refactor", "architecture", "migrate", "redesign", "entire", "across", "codebase", "overhaul",
];
const WIDE_SCOPE: &[&str] = &["multiple", "several", "all", "every", "each"];
const UNCERTAIN: &[&str] = &[
    "investigate", "debug", "why", "unknown", "figure out", "intermittent", "flaky", "crash",
    "sometimes", "unclear",
];
const DEPENDENT: &[&str] = &[
    "api", "database", "service", "library", "dependency", "integration", "module", "package",
    "framework", "external",
];
const RISKY: &[&str] = &[
    "production", "prod", "database", "migration", "security", "auth", "payment", "delete",
    "deploy", "credentials",
];
const NOVEL: &[&str] = &[
    "research", "new technology", "algorithm", "prototype", "experimental", "novel", "unfamiliar",
    "machine learning",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl ComplexityLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=15 => Self::Trivial,
            16..=35 => Self::Simple,
            36..=55 => Self::Moderate,
            56..=75 => Self::Complex,
            _ => Self::Expert,
        }
    }

    fn base_iterations(&self) -> f64 {
        match self {
            Self::Trivial => 3.0,
            Self::Simple => 5.0,
            Self::Moderate => 10.0,
            Self::Complex => 20.0,
            Self::Expert => 30.0,
        }
    }

    fn base_minutes(&self) -> f64 {
        match self {
            Self::Trivial => 1.0,
            Self::Simple => 3.0,
            Self::Moderate => 10.0,
            Self::Complex => 30.0,
            Self::Expert => 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    Direct,
    StepByStep,
    Exploratory,
    Collaborative,
}

/// Each factor is in 1..=10
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub scope: u32,
    pub uncertainty: u32,
    pub dependencies: u32,
    pub risk: u32,
    pub novelty: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    pub score: u32,
    pub level: ComplexityLevel,
    pub factors: ComplexityFactors,
    pub estimated_iterations: u32,
    pub estimated_minutes: u32,
    pub approach: Approach,
    pub reasoning: Vec<String>,
}

/// What is known about the workspace besides the task text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexityContext {
    pub file_count: Option<usize>,
    pub has_existing_code: bool,
    pub has_tests: bool,
}

impl Default for ComplexityContext {
    fn default() -> Self {
        Self {
            file_count: None,
            has_existing_code: true,
            has_tests: true,
        }
    }
}

fn hits(text: &str, words: &[&str]) -> u32 {
    let toks: Vec<&str> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|t| !t.is_empty())
        .collect();
    words
        .iter()
        .filter(|w| {
            if w.contains(' ') {
                text.contains(*w)
            } else {
                toks.contains(w)
            }
        })
        .count() as u32
}

fn clamp_factor(v: u32) -> u32 {
    v.clamp(1, 10)
}

#[derive(Debug, Clone, Default)]
pub struct ComplexityEstimator;

impl ComplexityEstimator {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate(
        &self,
        task: &str,
        intent: Option<&IntentClassification>,
        ctx: &ComplexityContext,
    ) -> ComplexityEstimate {
        let text = task.to_lowercase();
        let mut reasoning = Vec::new();

        let files = ctx
            .file_count
            .unwrap_or_else(|| extract_file_references(task).len()) as u32;
        let words = text.split_whitespace().count();
        let mut scope = 1 + files.min(4);
        if words > 30 {
            scope += 1;
        }
        if words > 80 {
            scope += 1;
        }
        if hits(&text, BROAD_SCOPE) > 0 {
            scope += 3;
            reasoning.push("broad change across the codebase".to_string());
        }
        if hits(&text, WIDE_SCOPE) > 0 {
            scope += 1;
        }
        if intent.is_some_and(|i| i.complexity == ComplexityTier::Complex) {
            scope += 2;
        }

        let mut uncertainty = 2 + (hits(&text, UNCERTAIN) * 2).min(6);
        if !ctx.has_existing_code {
            uncertainty += 2;
            reasoning.push("no prior code context".to_string());
        }

        let dependencies = 1 + hits(&text, DEPENDENT) * 2;

        let mut risk = 1 + hits(&text, RISKY) * 3;
        if !ctx.has_tests {
            risk += 2;
            reasoning.push("no tests to catch regressions".to_string());
        }

        let novelty = 1 + hits(&text, NOVEL) * 3;

        let factors = ComplexityFactors {
            scope: clamp_factor(scope),
            uncertainty: clamp_factor(uncertainty),
            dependencies: clamp_factor(dependencies),
            risk: clamp_factor(risk),
            novelty: clamp_factor(novelty),
        };

        let weighted = factors.scope as f64 * SCOPE_WEIGHT
            + factors.uncertainty as f64 * UNCERTAINTY_WEIGHT
            + factors.dependencies as f64 * DEPENDENCY_WEIGHT
            + factors.risk as f64 * RISK_WEIGHT
            + factors.novelty as f64 * NOVELTY_WEIGHT;
        let score = (weighted * 10.0).round().clamp(1.0, 100.0) as u32;
        let level = ComplexityLevel::from_score(score);

        let mut iterations = level.base_iterations();
        let mut minutes = level.base_minutes();
        if factors.uncertainty > HIGH_FACTOR {
            iterations *= UNCERTAINTY_MULTIPLIER;
            minutes *= UNCERTAINTY_MULTIPLIER;
            reasoning.push("high uncertainty".to_string());
        }
        if factors.risk > HIGH_FACTOR {
            iterations *= RISK_MULTIPLIER;
            minutes *= RISK_MULTIPLIER;
            reasoning.push("high risk".to_string());
        }

        let approach = if factors.uncertainty > HIGH_FACTOR {
            Approach::Exploratory
        } else if factors.risk > HIGH_FACTOR {
            Approach::Collaborative
        } else if level <= ComplexityLevel::Simple {
            Approach::Direct
        } else {
            Approach::StepByStep
        };

        ComplexityEstimate {
            score,
            level,
            factors,
            estimated_iterations: iterations.ceil() as u32,
            estimated_minutes: minutes.ceil() as u32,
            approach,
            reasoning,
        }
    }
}
