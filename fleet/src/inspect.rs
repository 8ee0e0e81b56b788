//! Offline reports over a state snapshot, backing the CLI commands.
//!
//! Everything here is read-only: the snapshot is loaded, evaluated with the
//! same core logic the daemon uses, and rendered.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::budget::{BudgetStatus, BudgetTracker, BudgetViolation};
use crate::core::complexity::{ComplexityScorer, ComplexityTier};
use crate::core::invariants::validate_all;
use crate::core::model_selector::{ModelSelector, SelectionSource};
use crate::core::stuck::{StuckDetection, StuckDetector};
use crate::io::config::FleetConfig;
use crate::io::snapshot::Snapshot;
use crate::model::{GoalStatus, Violation};

pub fn validate_snapshot(snapshot: &Snapshot) -> Vec<Violation> {
    validate_all(&snapshot.goals, &snapshot.work_items)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalScore {
    pub goal_id: String,
    pub score: u8,
    pub tier: ComplexityTier,
    pub planning_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemScore {
    pub work_item_id: String,
    pub score: u8,
    pub tier: ComplexityTier,
    pub model: Option<String>,
    pub source: Option<SelectionSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreReport {
    pub goals: Vec<GoalScore>,
    pub work_items: Vec<ItemScore>,
}

pub fn score_report(snapshot: &Snapshot, config: &FleetConfig) -> ScoreReport {
    let selector = ModelSelector::new(
        ComplexityScorer::new(config.complexity.clone()),
        config.models.clone(),
    );
    let scorer = selector.scorer();

    let goals = snapshot
        .goals
        .iter()
        .map(|goal| {
            let scored = scorer.score_goal(goal);
            GoalScore {
                goal_id: goal.id.clone(),
                score: scored.score,
                tier: scored.tier,
                planning_model: selector
                    .select_model_for_planning(goal)
                    .ok()
                    .map(|selection| selection.model),
            }
        })
        .collect();

    let work_items = snapshot
        .work_items
        .iter()
        .map(|item| {
            let scored = scorer.score_work_item(item);
            let selection = selector.select_model(item).ok();
            ItemScore {
                work_item_id: item.id.clone(),
                score: scored.score,
                tier: scored.tier,
                source: selection.as_ref().map(|s| s.source),
                model: selection.map(|s| s.model),
            }
        })
        .collect();

    ScoreReport { goals, work_items }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalBudget {
    pub goal_id: String,
    pub status: BudgetStatus,
    pub violations: Vec<BudgetViolation>,
}

pub fn budget_report(snapshot: &Snapshot, config: &FleetConfig) -> Vec<GoalBudget> {
    let tracker = BudgetTracker::new(config.budget.clone());
    snapshot
        .goals
        .iter()
        .map(|goal| GoalBudget {
            goal_id: goal.id.clone(),
            status: tracker.budget_status(goal),
            violations: tracker.check_budget(goal),
        })
        .collect()
}

/// Stuck detections for every goal that is still queued or active.
pub fn stuck_report(
    snapshot: &Snapshot,
    config: &FleetConfig,
    now: DateTime<Utc>,
) -> Vec<StuckDetection> {
    let detector = StuckDetector::new(config.stuck.clone());
    snapshot
        .goals
        .iter()
        .filter(|goal| matches!(goal.status, GoalStatus::Queued | GoalStatus::Active))
        .flat_map(|goal| {
            let items: Vec<_> = snapshot.items_of(&goal.id).cloned().collect();
            let runs: Vec<_> = items
                .iter()
                .flat_map(|item| snapshot.runs_of(&item.id).cloned())
                .collect();
            detector.scan_goal(&goal.id, &items, &runs, now)
        })
        .collect()
}
