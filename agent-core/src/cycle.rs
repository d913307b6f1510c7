//! Cycle Detector: spots the loop repeating itself
//!
//! Each iteration contributes a signature made of the tool names it called and
//! the paths they touched. Two shapes are recognized: the same signature on
//! consecutive iterations, and an A/B (or A/B/C) oscillation.

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

const HISTORY_LIMIT: usize = 20;
const MIN_REPETITIONS: usize = 3;
const MIN_PERIODS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSeverity {
    Low,
    Medium,
    High,
}

impl CycleSeverity {
    fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CycleKind {
    Repetition,
    Oscillation { period: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    GatherMoreContext,
    ChangeApproach,
    TryAlternativeTool,
    DecomposeGoal,
    AbandonGoal,
}

impl CorrectiveAction {
    /// Instruction appended to the next observation
    pub fn hint(&self) -> &'static str {
        match self {
            Self::GatherMoreContext => {
                "You seem to be going back and forth. Gather more context before acting again."
            }
            Self::ChangeApproach => {
                "You are repeating the same action with the same result. Use what you already have or change approach."
            }
            Self::TryAlternativeTool => {
                "The same action keeps failing. Try a different tool or different parameters."
            }
            Self::DecomposeGoal => {
                "You are alternating between the same actions. Break the task into smaller steps."
            }
            Self::AbandonGoal => "This goal is stuck in a loop and has been abandoned.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub kind: CycleKind,
    pub severity: CycleSeverity,
    pub repetitions: usize,
    pub suggestion: CorrectiveAction,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    actions: Vec<String>,
    targets: BTreeSet<String>,
}

impl Signature {
    fn describe(&self) -> String {
        let targets: Vec<&str> = self.targets.iter().map(String::as_str).collect();
        if targets.is_empty() {
            self.actions.join("+")
        } else {
            format!("{} on {}", self.actions.join("+"), targets.join(", "))
        }
    }
}

#[derive(Debug, Clone)]
struct IterationRecord {
    signature: Signature,
    failed: bool,
}

#[derive(Debug, Default)]
pub struct CycleDetector {
    history: VecDeque<IterationRecord>,
    goal: Option<String>,
}

impl CycleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.goal = None;
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Record one iteration; `failed` is true when every tool call in it failed
    pub fn record(
        &mut self,
        actions: &[String],
        targets: &[String],
        goal: &str,
        failed: bool,
    ) -> Option<CycleReport> {
        if self.goal.as_deref() != Some(goal) {
            if self.goal.is_some() {
                debug!("Goal changed, clearing cycle history");
            }
            self.history.clear();
            self.goal = Some(goal.to_string());
        }
        if actions.is_empty() {
            return None;
        }

        self.history.push_back(IterationRecord {
            signature: Signature {
                actions: actions.to_vec(),
                targets: targets.iter().cloned().collect(),
            },
            failed,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        let report = [self.detect_repetition(), self.detect_oscillation()]
            .into_iter()
            .flatten()
            .max_by_key(|r| r.severity);
        if let Some(r) = &report {
            warn!(severity = ?r.severity, repetitions = r.repetitions, "Cycle detected: {}", r.description);
        }
        report
    }

    fn detect_repetition(&self) -> Option<CycleReport> {
        let last = self.history.back()?;
        let run: Vec<&IterationRecord> = self
            .history
            .iter()
            .rev()
            .take_while(|r| r.signature == last.signature)
            .collect();
        let count = run.len();
        if count < MIN_REPETITIONS {
            return None;
        }
        let all_failed = run.iter().all(|r| r.failed);
        let mut severity = if count == MIN_REPETITIONS {
            CycleSeverity::Medium
        } else {
            CycleSeverity::High
        };
        if all_failed {
            severity = severity.escalate();
        }
        let suggestion = match (severity, all_failed) {
            (CycleSeverity::High, _) => CorrectiveAction::AbandonGoal,
            (_, true) => CorrectiveAction::TryAlternativeTool,
            _ => CorrectiveAction::ChangeApproach,
        };
        Some(CycleReport {
            kind: CycleKind::Repetition,
            severity,
            repetitions: count,
            suggestion,
            description: format!("{} repeated {count} times", last.signature.describe()),
        })
    }

    fn detect_oscillation(&self) -> Option<CycleReport> {
        let sigs: Vec<&Signature> = self.history.iter().map(|r| &r.signature).collect();
        let n = sigs.len();
        let mut best: Option<(usize, usize)> = None;

        for period in 2..=3 {
            if n < period * MIN_PERIODS {
                continue;
            }
            let window = &sigs[n - period..];
            // a window with a repeated member is plain repetition, not oscillation
            let distinct = window
                .iter()
                .enumerate()
                .all(|(i, a)| window[i + 1..].iter().all(|b| a != b));
            if !distinct {
                continue;
            }
            let mut span = period;
            while span < n && sigs[n - 1 - span] == sigs[n - 1 - span + period] {
                span += 1;
            }
            let periods = span / period;
            if periods >= MIN_PERIODS && best.map_or(true, |(_, p)| periods > p) {
                best = Some((period, periods));
            }
        }

        let (period, periods) = best?;
        let severity = match periods {
            2 => CycleSeverity::Low,
            3 => CycleSeverity::Medium,
            _ => CycleSeverity::High,
        };
        let suggestion = match severity {
            CycleSeverity::Low => CorrectiveAction::GatherMoreContext,
            CycleSeverity::Medium => CorrectiveAction::DecomposeGoal,
            CycleSeverity::High => CorrectiveAction::AbandonGoal,
        };
        let cycle: Vec<String> = sigs[n - period..].iter().map(|s| s.describe()).collect();
        Some(CycleReport {
            kind: CycleKind::Oscillation { period },
            severity,
            repetitions: periods,
            suggestion,
            description: format!("oscillating between [{}] {periods} times", cycle.join(" -> ")),
        })
    }
}
