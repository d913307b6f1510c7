//! Iteration Budget Allocator
//!
//! Sizes a per-run iteration budget from the complexity estimate and adjusts it
//! while the run progresses: bonus iterations when nearly done, compression when
//! things go well, early stop when they clearly don't.

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::complexity::{ComplexityContext, ComplexityEstimate, ComplexityEstimator};
use crate::config::BudgetConfig;

const STAGNATION_LIMIT: u32 = 5;
const BONUS_STAGNATION_LIMIT: u32 = 3;
const LARGE_BONUS: u32 = 5;
const SMALL_BONUS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IterationBudget {
    pub total: u32,
    pub used: u32,
    pub bonus: u32,
}

impl IterationBudget {
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.total
    }
}

/// Progress snapshot fed back after every iteration
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressMetrics {
    pub iterations: u32,
    /// Successful tool calls over attempted tool calls, 0..=1
    pub success_rate: f64,
    /// Average confidence of the tools used, 0..=1
    pub confidence: f64,
    /// Consecutive iterations without measurable progress
    pub stagnation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    Stagnation,
    LowConfidence,
    LowSuccessRate,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "iteration budget exhausted",
            Self::Stagnation => "no progress for too many iterations",
            Self::LowConfidence => "confidence too low to continue",
            Self::LowSuccessRate => "too many failed tool calls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Continue,
    BonusGranted { amount: u32, total: u32 },
    Compressed { total: u32 },
    Stop(StopReason),
}

pub struct BudgetAllocator {
    config: BudgetConfig,
    estimator: ComplexityEstimator,
    budgets: DashMap<String, IterationBudget>,
}

impl BudgetAllocator {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            estimator: ComplexityEstimator::new(),
            budgets: DashMap::new(),
        }
    }

    /// Size a budget for `task` and register it under `run_id`
    pub fn allocate(&self, run_id: &str, task: &str) -> IterationBudget {
        let estimate = self
            .estimator
            .estimate(task, None, &ComplexityContext::default());
        self.allocate_from_estimate(run_id, &estimate)
    }

    pub fn allocate_from_estimate(&self, run_id: &str, estimate: &ComplexityEstimate) -> IterationBudget {
        let total = estimate
            .estimated_iterations
            .clamp(self.config.min_iterations, self.config.max_iterations.max(self.config.min_iterations));
        let budget = IterationBudget {
            total,
            used: 0,
            bonus: 0,
        };
        self.budgets.insert(run_id.to_string(), budget);
        info!(run_id, total, level = ?estimate.level, "Allocated iteration budget");
        budget
    }

    pub fn get(&self, run_id: &str) -> Option<IterationBudget> {
        self.budgets.get(run_id).map(|b| *b)
    }

    pub fn release(&self, run_id: &str) -> Option<IterationBudget> {
        self.budgets.remove(run_id).map(|(_, b)| b)
    }

    pub fn check_and_adjust(&self, run_id: &str, metrics: &ProgressMetrics) -> BudgetDecision {
        let Some(mut budget) = self.budgets.get_mut(run_id) else {
            warn!(run_id, "No budget allocated for run");
            return BudgetDecision::Continue;
        };
        budget.used = metrics.iterations;

        if let Some(reason) = self.early_stop(metrics) {
            info!(run_id, reason = reason.as_str(), "Stopping run early");
            return BudgetDecision::Stop(reason);
        }

        if budget.is_exhausted() {
            let wanted = if metrics.stagnation > BONUS_STAGNATION_LIMIT {
                0
            } else if metrics.confidence > 0.7 && metrics.success_rate > 0.6 {
                LARGE_BONUS
            } else if metrics.success_rate > 0.4 {
                SMALL_BONUS
            } else {
                0
            };
            let amount = wanted.min(self.config.max_bonus_total.saturating_sub(budget.bonus));
            if amount == 0 {
                return BudgetDecision::Stop(StopReason::Exhausted);
            }
            budget.total += amount;
            budget.bonus += amount;
            info!(run_id, amount, total = budget.total, "Granted bonus iterations");
            return BudgetDecision::BonusGranted {
                amount,
                total: budget.total,
            };
        }

        if metrics.success_rate > self.config.bonus_threshold && budget.used * 2 > budget.total {
            let floor = budget.used + self.config.min_continuation_slack;
            let shrunk = (budget.total as f64 * self.config.compression_factor).floor() as u32;
            let total = shrunk.max(floor);
            if total < budget.total {
                debug!(run_id, from = budget.total, to = total, "Compressed iteration budget");
                budget.total = total;
                return BudgetDecision::Compressed { total };
            }
        }

        BudgetDecision::Continue
    }

    fn early_stop(&self, m: &ProgressMetrics) -> Option<StopReason> {
        if m.stagnation > STAGNATION_LIMIT {
            Some(StopReason::Stagnation)
        } else if m.confidence < 0.2 && m.iterations > 10 {
            Some(StopReason::LowConfidence)
        } else if m.success_rate < 0.1 && m.iterations > 15 {
            Some(StopReason::LowSuccessRate)
        } else {
            None
        }
    }
}

impl Default for BudgetAllocator {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
