//! Goal Stack: hierarchical decomposition of one instruction
//!
//! Goals flow through: Pending → Active → Completed/Failed
//!
//! At most one goal is active at a time. Leaf goals wait in a priority queue
//! (lower number first, then insertion order); parents settle automatically
//! once every child is terminal.

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::intent::ComplexityTier;

pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl GoalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GoalError {
    #[error("goal not found: {0}")]
    NotFound(String),
    #[error("goal {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("goal {0} is already active")]
    AnotherActive(String),
    #[error("goal {0} still has open subgoals")]
    OpenChildren(String),
    #[error("goal {0} is already decomposed")]
    AlreadyDecomposed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GoalMetadata {
    pub complexity: Option<ComplexityTier>,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Goal {
    pub id: String,
    pub parent: Option<String>,
    pub description: String,
    pub status: GoalStatus,
    pub children: Vec<String>,
    /// Files relevant to this goal
    pub context: Vec<String>,
    pub metadata: GoalMetadata,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Input for `decompose`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgoalSpec {
    pub description: String,
    pub context: Vec<String>,
    pub priority: i32,
}

impl SubgoalSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            context: Vec::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Default)]
pub struct GoalStack {
    goals: HashMap<String, Goal>,
    root: Option<String>,
    active: Option<String>,
    queue: PriorityQueue<String, Reverse<(i32, u64)>>,
    seq: u64,
}

impl GoalStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stack with a single pending root goal
    pub fn set_root(
        &mut self,
        description: &str,
        context: Vec<String>,
        complexity: Option<ComplexityTier>,
    ) -> String {
        self.goals.clear();
        self.queue.clear();
        self.active = None;
        let id = self.insert(None, description, context, complexity, DEFAULT_PRIORITY);
        self.root = Some(id.clone());
        id
    }

    fn insert(
        &mut self,
        parent: Option<String>,
        description: &str,
        context: Vec<String>,
        complexity: Option<ComplexityTier>,
        priority: i32,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.goals.insert(
            id.clone(),
            Goal {
                id: id.clone(),
                parent,
                description: description.to_string(),
                status: GoalStatus::Pending,
                children: Vec::new(),
                context,
                metadata: GoalMetadata {
                    complexity,
                    priority,
                },
                failure_reason: None,
                created_at: Utc::now(),
                finished_at: None,
            },
        );
        self.seq += 1;
        self.queue.push(id.clone(), Reverse((priority, self.seq)));
        id
    }

    fn goal(&self, id: &str) -> Result<&Goal, GoalError> {
        self.goals.get(id).ok_or_else(|| GoalError::NotFound(id.to_string()))
    }

    fn goal_mut(&mut self, id: &str) -> Result<&mut Goal, GoalError> {
        self.goals
            .get_mut(id)
            .ok_or_else(|| GoalError::NotFound(id.to_string()))
    }

    /// Split a pending or active goal into children; the parent waits on them
    pub fn decompose(&mut self, parent_id: &str, subgoals: Vec<SubgoalSpec>) -> Result<Vec<String>, GoalError> {
        let parent = self.goal(parent_id)?;
        if parent.status.is_terminal() {
            return Err(GoalError::InvalidTransition {
                id: parent_id.to_string(),
                from: parent.status.as_str(),
                to: "decomposed",
            });
        }
        if !parent.children.is_empty() {
            return Err(GoalError::AlreadyDecomposed(parent_id.to_string()));
        }
        if subgoals.is_empty() {
            return Ok(Vec::new());
        }
        let complexity = parent.metadata.complexity;

        self.queue.remove(parent_id);
        if self.active.as_deref() == Some(parent_id) {
            self.active = None;
        }
        let ids: Vec<String> = subgoals
            .into_iter()
            .map(|s| {
                self.insert(
                    Some(parent_id.to_string()),
                    &s.description,
                    s.context,
                    complexity,
                    s.priority,
                )
            })
            .collect();
        let parent = self.goal_mut(parent_id)?;
        parent.status = GoalStatus::Pending;
        parent.children = ids.clone();
        info!(goal = parent_id, subgoals = ids.len(), "Decomposed goal");
        Ok(ids)
    }

    pub fn start(&mut self, id: &str) -> Result<(), GoalError> {
        if let Some(active) = &self.active {
            if active != id {
                return Err(GoalError::AnotherActive(active.clone()));
            }
        }
        let goal = self.goal(id)?;
        if goal.status != GoalStatus::Pending {
            return Err(GoalError::InvalidTransition {
                id: id.to_string(),
                from: goal.status.as_str(),
                to: "active",
            });
        }
        if goal.children.iter().any(|c| {
            self.goals
                .get(c)
                .is_some_and(|g| !g.status.is_terminal())
        }) {
            return Err(GoalError::OpenChildren(id.to_string()));
        }
        self.queue.remove(id);
        self.goal_mut(id)?.status = GoalStatus::Active;
        self.active = Some(id.to_string());
        debug!(goal = id, "Goal started");
        Ok(())
    }

    pub fn complete(&mut self, id: &str) -> Result<(), GoalError> {
        let goal = self.goal(id)?;
        if goal.status.is_terminal() {
            return Err(GoalError::InvalidTransition {
                id: id.to_string(),
                from: goal.status.as_str(),
                to: "completed",
            });
        }
        if goal.children.iter().any(|c| {
            self.goals
                .get(c)
                .is_some_and(|g| !g.status.is_terminal())
        }) {
            return Err(GoalError::OpenChildren(id.to_string()));
        }
        self.finish(id, GoalStatus::Completed, None);
        Ok(())
    }

    /// Fail a goal; its unfinished descendants fail with it
    pub fn fail(&mut self, id: &str, reason: &str) -> Result<(), GoalError> {
        let goal = self.goal(id)?;
        if goal.status.is_terminal() {
            return Err(GoalError::InvalidTransition {
                id: id.to_string(),
                from: goal.status.as_str(),
                to: "failed",
            });
        }
        self.finish(id, GoalStatus::Failed, Some(reason.to_string()));
        Ok(())
    }

    fn finish(&mut self, id: &str, status: GoalStatus, reason: Option<String>) {
        let children = match self.goals.get_mut(id) {
            Some(goal) => {
                goal.status = status;
                goal.failure_reason = reason.clone();
                goal.finished_at = Some(Utc::now());
                goal.children.clone()
            }
            None => return,
        };
        self.queue.remove(id);
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        info!(goal = id, status = status.as_str(), "Goal finished");

        if status == GoalStatus::Failed {
            for child in children {
                let open = self
                    .goals
                    .get(&child)
                    .is_some_and(|g| !g.status.is_terminal());
                if open {
                    self.finish(&child, GoalStatus::Failed, Some("parent goal failed".to_string()));
                }
            }
        }

        let parent = self.goals.get(id).and_then(|g| g.parent.clone());
        if let Some(parent) = parent {
            self.settle_parent(&parent);
        }
    }

    fn settle_parent(&mut self, parent_id: &str) {
        let Some(parent) = self.goals.get(parent_id) else {
            return;
        };
        if parent.status.is_terminal() {
            return;
        }
        let statuses: Vec<GoalStatus> = parent
            .children
            .iter()
            .filter_map(|c| self.goals.get(c).map(|g| g.status))
            .collect();
        if statuses.iter().any(|s| !s.is_terminal()) {
            return;
        }
        if statuses.iter().all(|s| *s == GoalStatus::Completed) {
            self.finish(parent_id, GoalStatus::Completed, None);
        } else {
            self.finish(parent_id, GoalStatus::Failed, Some("a subgoal failed".to_string()));
        }
    }

    /// The active goal, or the next queued pending leaf (which is started)
    pub fn activate_next(&mut self) -> Option<String> {
        if let Some(active) = &self.active {
            return Some(active.clone());
        }
        while let Some((id, _)) = self.queue.pop() {
            let ready = self
                .goals
                .get(&id)
                .is_some_and(|g| g.status == GoalStatus::Pending && g.children.is_empty());
            if ready && self.start(&id).is_ok() {
                return Some(id);
            }
        }
        None
    }

    pub fn get(&self, id: &str) -> Option<&Goal> {
        self.goals.get(id)
    }

    pub fn active(&self) -> Option<&Goal> {
        self.active.as_ref().and_then(|id| self.goals.get(id))
    }

    pub fn root(&self) -> Option<&Goal> {
        self.root.as_ref().and_then(|id| self.goals.get(id))
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.root().map_or(true, |g| g.status.is_terminal())
    }

    /// Fraction of leaf goals completed
    pub fn progress(&self) -> f64 {
        let leaves: Vec<&Goal> = self.goals.values().filter(|g| g.children.is_empty()).collect();
        if leaves.is_empty() {
            return 0.0;
        }
        let done = leaves
            .iter()
            .filter(|g| g.status == GoalStatus::Completed)
            .count();
        done as f64 / leaves.len() as f64
    }

    /// Children of `id` in creation order
    pub fn children(&self, id: &str) -> Vec<&Goal> {
        self.goals
            .get(id)
            .map(|g| g.children.iter().filter_map(|c| self.goals.get(c)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_root_lifecycle() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("fix it", vec![], None);
        assert_eq!(stack.activate_next(), Some(root.clone()));
        assert_eq!(stack.active().unwrap().status, GoalStatus::Active);
        stack.complete(&root).unwrap();
        assert!(stack.is_finished());
        assert!(stack.activate_next().is_none());
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec![], None);
        let ids = stack
            .decompose(
                &root,
                vec![
                    SubgoalSpec::new("a"),
                    SubgoalSpec::new("b").with_priority(1),
                    SubgoalSpec::new("c"),
                ],
            )
            .unwrap();
        assert_eq!(stack.activate_next(), Some(ids[1].clone()));
        stack.complete(&ids[1]).unwrap();
        assert_eq!(stack.activate_next(), Some(ids[0].clone()));
        stack.complete(&ids[0]).unwrap();
        assert_eq!(stack.activate_next(), Some(ids[2].clone()));
    }

    #[test]
    fn test_single_active_goal() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec![], None);
        let ids = stack
            .decompose(&root, vec![SubgoalSpec::new("a"), SubgoalSpec::new("b")])
            .unwrap();
        stack.start(&ids[0]).unwrap();
        assert_eq!(
            stack.start(&ids[1]),
            Err(GoalError::AnotherActive(ids[0].clone()))
        );
    }

    #[test]
    fn test_parent_not_completed_with_open_children() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec![], None);
        let ids = stack
            .decompose(&root, vec![SubgoalSpec::new("a"), SubgoalSpec::new("b")])
            .unwrap();
        assert_eq!(stack.complete(&root), Err(GoalError::OpenChildren(root.clone())));

        stack.start(&ids[0]).unwrap();
        stack.complete(&ids[0]).unwrap();
        assert_eq!(stack.root().unwrap().status, GoalStatus::Pending);
        assert!((stack.progress() - 0.5).abs() < f64::EPSILON);

        stack.start(&ids[1]).unwrap();
        stack.complete(&ids[1]).unwrap();
        assert_eq!(stack.root().unwrap().status, GoalStatus::Completed);
    }

    #[test]
    fn test_failure_propagates() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec![], None);
        let ids = stack
            .decompose(&root, vec![SubgoalSpec::new("a"), SubgoalSpec::new("b")])
            .unwrap();
        stack.start(&ids[0]).unwrap();
        stack.fail(&ids[0], "stuck").unwrap();
        assert_eq!(stack.root().unwrap().status, GoalStatus::Pending);
        stack.start(&ids[1]).unwrap();
        stack.complete(&ids[1]).unwrap();
        assert_eq!(stack.root().unwrap().status, GoalStatus::Failed);
    }

    #[test]
    fn test_fail_cascades_to_children() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec![], None);
        let ids = stack
            .decompose(&root, vec![SubgoalSpec::new("a"), SubgoalSpec::new("b")])
            .unwrap();
        stack.fail(&root, "aborted").unwrap();
        for id in &ids {
            assert_eq!(stack.get(id).unwrap().status, GoalStatus::Failed);
        }
        assert!(stack.activate_next().is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec![], None);
        stack.start(&root).unwrap();
        stack.complete(&root).unwrap();
        assert!(matches!(
            stack.fail(&root, "late"),
            Err(GoalError::InvalidTransition { .. })
        ));
        assert!(matches!(stack.start("missing"), Err(GoalError::NotFound(_))));
        assert!(matches!(
            stack.decompose(&root, vec![SubgoalSpec::new("x")]),
            Err(GoalError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_decompose_active_goal_releases_it() {
        let mut stack = GoalStack::new();
        let root = stack.set_root("root", vec!["a.rs".into()], Some(ComplexityTier::Complex));
        stack.start(&root).unwrap();
        let ids = stack.decompose(&root, vec![SubgoalSpec::new("a")]).unwrap();
        assert!(stack.active().is_none());
        assert_eq!(stack.activate_next(), Some(ids[0].clone()));
        assert_eq!(
            stack.get(&ids[0]).unwrap().metadata.complexity,
            Some(ComplexityTier::Complex)
        );
        assert_eq!(stack.children(&root).len(), 1);
    }
}
