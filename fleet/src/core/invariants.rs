//! Semantic invariants for goals and work items.
//!
//! Every check runs to completion and returns the full list of violations;
//! callers decide whether to reject the data or escalate.

use std::collections::{BTreeMap, HashSet};

use crate::core::graph::validate_dependencies;
use crate::model::{Goal, Violation, WorkItem};

/// Check a single goal:
/// - non-empty title
/// - at least one success criterion
/// - declared budgets > 0
/// - spend non-negative and within declared budgets
/// - priority in `0..=100`
pub fn validate_goal(goal: &Goal) -> Vec<Violation> {
    let mut errors = Vec::new();
    let field = |name: &str| format!("goals[{}].{}", goal.id, name);

    if goal.title.trim().is_empty() {
        errors.push(Violation::new(field("title"), "title must not be empty"));
    }
    if goal.success_criteria.is_empty() {
        errors.push(Violation::new(
            field("success_criteria"),
            "at least one success criterion is required",
        ));
    }
    for (pos, criterion) in goal.success_criteria.iter().enumerate() {
        if criterion.description.trim().is_empty() {
            errors.push(Violation::new(
                field(&format!("success_criteria[{}].description", pos)),
                "description must not be empty",
            ));
        }
    }
    if goal.priority > 100 {
        errors.push(Violation::new(
            field("priority"),
            format!("priority {} exceeds 100", goal.priority),
        ));
    }

    if goal.budget_tokens == Some(0) {
        errors.push(Violation::new(field("budget_tokens"), "budget must be > 0"));
    }
    check_float_budget(&mut errors, field("budget_time_minutes"), goal.budget_time_minutes);
    check_float_budget(&mut errors, field("budget_cost_usd"), goal.budget_cost_usd);

    check_spend(&mut errors, field("spent_time_minutes"), goal.spent_time_minutes);
    check_spend(&mut errors, field("spent_cost_usd"), goal.spent_cost_usd);

    if let Some(limit) = goal.budget_tokens {
        if goal.spent_tokens > limit {
            errors.push(Violation::new(
                field("spent_tokens"),
                format!("spent {} exceeds budget {}", goal.spent_tokens, limit),
            ));
        }
    }
    check_overspend(
        &mut errors,
        field("spent_time_minutes"),
        goal.spent_time_minutes,
        goal.budget_time_minutes,
    );
    check_overspend(
        &mut errors,
        field("spent_cost_usd"),
        goal.spent_cost_usd,
        goal.budget_cost_usd,
    );

    errors
}

fn check_float_budget(errors: &mut Vec<Violation>, field: String, budget: Option<f64>) {
    if let Some(limit) = budget {
        if !(limit.is_finite() && limit > 0.0) {
            errors.push(Violation::new(field, "budget must be > 0"));
        }
    }
}

fn check_spend(errors: &mut Vec<Violation>, field: String, spent: f64) {
    if !(spent.is_finite() && spent >= 0.0) {
        errors.push(Violation::new(field, format!("spend {} is negative", spent)));
    }
}

fn check_overspend(errors: &mut Vec<Violation>, field: String, spent: f64, budget: Option<f64>) {
    if let Some(limit) = budget {
        if limit > 0.0 && spent > limit {
            errors.push(Violation::new(
                field,
                format!("spent {} exceeds budget {}", spent, limit),
            ));
        }
    }
}

/// Check a single work item against the set of known goal ids.
pub fn validate_work_item(item: &WorkItem, goal_ids: &HashSet<&str>) -> Vec<Violation> {
    let mut errors = Vec::new();
    let field = |name: &str| format!("work_items[{}].{}", item.id, name);

    if item.title.trim().is_empty() {
        errors.push(Violation::new(field("title"), "title must not be empty"));
    }
    if !goal_ids.contains(item.goal_id.as_str()) {
        errors.push(Violation::new(
            field("goal_id"),
            format!("goal '{}' does not exist", item.goal_id),
        ));
    }
    if item.max_retries == 0 {
        errors.push(Violation::new(field("max_retries"), "max_retries must be > 0"));
    }
    if item.priority > 100 {
        errors.push(Violation::new(
            field("priority"),
            format!("priority {} exceeds 100", item.priority),
        ));
    }
    errors
}

/// Check goals and work items together:
/// - no duplicate goal or work item ids
/// - every goal and work item passes its own checks
/// - each goal's dependency graph only references its own items and is acyclic
pub fn validate_all(goals: &[Goal], items: &[WorkItem]) -> Vec<Violation> {
    let mut errors = Vec::new();

    let mut seen_goals = HashSet::new();
    for goal in goals {
        if !seen_goals.insert(goal.id.as_str()) {
            errors.push(Violation::new(
                format!("goals[{}]", goal.id),
                "duplicate goal id",
            ));
        }
        errors.extend(validate_goal(goal));
    }

    let mut seen_items = HashSet::new();
    for item in items {
        if !seen_items.insert(item.id.as_str()) {
            errors.push(Violation::new(
                format!("work_items[{}]", item.id),
                "duplicate work item id",
            ));
        }
        errors.extend(validate_work_item(item, &seen_goals));
    }

    let mut by_goal: BTreeMap<&str, Vec<WorkItem>> = BTreeMap::new();
    for item in items {
        by_goal
            .entry(item.goal_id.as_str())
            .or_default()
            .push(item.clone());
    }
    for goal_items in by_goal.values() {
        errors.extend(validate_dependencies(goal_items));
    }

    errors
}
