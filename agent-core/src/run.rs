//! Run, step and report types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::budget::IterationBudget;
use crate::parser::ProposedPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    Plan,
    ToolCall,
    ToolResult,
    Answer,
    Error,
}

/// One observable unit of loop activity. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub index: usize,
    pub kind: StepKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

/// Per-call overrides of the configured loop settings
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub plan_mode: Option<bool>,
    /// Skip the permission gate for every call in this run
    pub trusted: bool,
    pub max_iterations: Option<u32>,
    pub max_duration_ms: Option<u64>,
    pub workspace_root: Option<PathBuf>,
}

impl RunOptions {
    pub fn trusted() -> Self {
        Self {
            trusted: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub final_text: String,
    pub steps: Vec<Step>,
    pub modified_files: Vec<String>,
    pub iterations: u32,
    pub cache_hits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ProposedPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<IterationBudget>,
}

impl RunReport {
    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }
}

/// Append-only step log owned by one run
#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<Step>,
}

impl StepLog {
    pub fn push(
        &mut self,
        kind: StepKind,
        content: impl Into<String>,
        tool: Option<&str>,
        success: Option<bool>,
        iteration: u32,
    ) -> &Step {
        let index = self.steps.len();
        self.steps.push(Step {
            index,
            kind,
            content: content.into(),
            tool: tool.map(str::to_string),
            success,
            iteration,
            timestamp: Utc::now(),
        });
        &self.steps[index]
    }

    pub fn as_slice(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_vec(self) -> Vec<Step> {
        self.steps
    }
}
