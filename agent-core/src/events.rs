//! Typed event stream emitted by the orchestration loop
//!
//! Events are broadcast to any number of subscribers; a subscriber that falls
//! behind loses the oldest events. A short history is kept for late readers.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cycle::CycleReport;
use crate::parser::ProposedPlan;
use crate::run::{RunStatus, Step};

const CHANNEL_CAPACITY: usize = 1024;
const MAX_RECENT: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        run_id: String,
        instruction: String,
    },
    Iteration {
        run_id: String,
        iteration: u32,
        budget: u32,
    },
    Token {
        run_id: String,
        text: String,
    },
    StepAdded {
        run_id: String,
        step: Step,
    },
    ToolExecuting {
        run_id: String,
        tool: String,
        params: serde_json::Value,
    },
    ToolResult {
        run_id: String,
        tool: String,
        success: bool,
        cached: bool,
        duration_ms: u64,
    },
    PlanProposed {
        run_id: String,
        plan: ProposedPlan,
    },
    FileModified {
        run_id: String,
        path: String,
    },
    CycleDetected {
        run_id: String,
        report: CycleReport,
    },
    Completed {
        run_id: String,
        status: RunStatus,
        iterations: u32,
    },
    Aborted {
        run_id: String,
    },
    Error {
        run_id: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Started { run_id, .. }
            | Self::Iteration { run_id, .. }
            | Self::Token { run_id, .. }
            | Self::StepAdded { run_id, .. }
            | Self::ToolExecuting { run_id, .. }
            | Self::ToolResult { run_id, .. }
            | Self::PlanProposed { run_id, .. }
            | Self::FileModified { run_id, .. }
            | Self::CycleDetected { run_id, .. }
            | Self::Completed { run_id, .. }
            | Self::Aborted { run_id }
            | Self::Error { run_id, .. } => run_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Iteration { .. } => "iteration",
            Self::Token { .. } => "token",
            Self::StepAdded { .. } => "step_added",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolResult { .. } => "tool_result",
            Self::PlanProposed { .. } => "plan_proposed",
            Self::FileModified { .. } => "file_modified",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Error { .. } => "error",
        }
    }
}

pub struct EventEmitter {
    sender: broadcast::Sender<AgentEvent>,
    recent: Mutex<VecDeque<AgentEvent>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        // Tokens are too chatty for the history
        if !matches!(event, AgentEvent::Token { .. }) {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == MAX_RECENT {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        if self.sender.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    pub fn recent_events(&self) -> Vec<AgentEvent> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(AgentEvent::Started {
            run_id: "r1".into(),
            instruction: "do it".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind(), "started");
        assert_eq!(ev.run_id(), "r1");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new();
        emitter.emit(AgentEvent::Aborted { run_id: "r".into() });
        emitter.emit(AgentEvent::Token {
            run_id: "r".into(),
            text: "t".into(),
        });
        let recent = emitter.recent_events();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind(), "aborted");
    }

    #[test]
    fn test_recent_bounded() {
        let emitter = EventEmitter::new();
        for i in 0..(MAX_RECENT + 10) {
            emitter.emit(AgentEvent::Iteration {
                run_id: "r".into(),
                iteration: i as u32,
                budget: 10,
            });
        }
        assert_eq!(emitter.recent_events().len(), MAX_RECENT);
    }

    #[test]
    fn test_event_json_shape() {
        let v = serde_json::to_value(AgentEvent::FileModified {
            run_id: "r".into(),
            path: "a.rs".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "file_modified");
        assert_eq!(v["path"], "a.rs");
    }
}
