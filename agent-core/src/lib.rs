//! taskpilot core: the autonomous task-execution loop
//!
//! The [`Orchestrator`] classifies an instruction, sizes its iteration
//! budget, then drives a think-act-observe loop against an
//! [`InferenceBackend`] and the tool registry until the model answers, a
//! plan is proposed, the budget stops it or the run is aborted.

pub mod budget;
pub mod complexity;
pub mod config;
pub mod context;
pub mod cycle;
pub mod events;
pub mod goal_stack;
pub mod inference;
pub mod intent;
pub mod openai;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod run;

pub use budget::{BudgetAllocator, BudgetDecision, IterationBudget, ProgressMetrics, StopReason};
pub use complexity::{ComplexityEstimate, ComplexityEstimator, ComplexityLevel};
pub use config::{load_config, AgentConfig};
pub use cycle::{CycleDetector, CycleReport, CycleSeverity};
pub use events::{AgentEvent, EventEmitter};
pub use goal_stack::{Goal, GoalError, GoalStack, GoalStatus, SubgoalSpec};
pub use inference::{
    GenerationOptions, InferenceBackend, InferenceError, Message, RetryPolicy, Role,
    TokenCallback,
};
pub use intent::{ComplexityTier, IntentClassification, IntentClassifier, TaskCategory};
pub use openai::OpenAiCompatibleBackend;
pub use orchestrator::{Orchestrator, ScorerAutoApprover};
pub use parser::{ParsedResponse, ProposedPlan, ResponseParser};
pub use run::{RunOptions, RunReport, RunStatus, Step, StepKind};
