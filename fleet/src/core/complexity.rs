//! Weighted complexity scoring for work items and goals.
//!
//! Each factor is normalized to `0..=100` and combined by fixed weights that
//! sum to 1.0. The rounded total maps onto a [`ComplexityTier`].

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::model::{Effort, Goal, ItemType, WorkItem};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Medium => "medium",
            ComplexityTier::Complex => "complex",
        };
        f.write_str(label)
    }
}

/// One normalized factor and its share of the total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexityFactor {
    pub name: &'static str,
    pub value: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexityScore {
    pub score: u8,
    pub tier: ComplexityTier,
    pub factors: Vec<ComplexityFactor>,
}

/// Weights for work item factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkItemWeights {
    pub item_type: f64,
    pub estimated_effort: f64,
    pub dependencies: f64,
    pub description_length: f64,
    pub retry_count: f64,
    pub priority: f64,
}

impl Default for WorkItemWeights {
    fn default() -> Self {
        Self {
            item_type: 0.20,
            estimated_effort: 0.25,
            dependencies: 0.10,
            description_length: 0.15,
            retry_count: 0.15,
            priority: 0.15,
        }
    }
}

impl WorkItemWeights {
    fn sum(&self) -> f64 {
        self.item_type
            + self.estimated_effort
            + self.dependencies
            + self.description_length
            + self.retry_count
            + self.priority
    }
}

/// Weights for goal-level planning factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalWeights {
    pub description_length: f64,
    pub success_criteria: f64,
    pub priority: f64,
    pub budget: f64,
}

impl Default for GoalWeights {
    fn default() -> Self {
        Self {
            description_length: 0.30,
            success_criteria: 0.30,
            priority: 0.15,
            budget: 0.25,
        }
    }
}

impl GoalWeights {
    fn sum(&self) -> f64 {
        self.description_length + self.success_criteria + self.priority + self.budget
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    pub work_item: WorkItemWeights,
    pub goal: GoalWeights,
    /// Scores at or below this are `simple`.
    pub simple_max: u8,
    /// Scores at or below this (and above `simple_max`) are `medium`.
    pub medium_max: u8,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            work_item: WorkItemWeights::default(),
            goal: GoalWeights::default(),
            simple_max: 35,
            medium_max: 65,
        }
    }
}

impl ComplexityConfig {
    pub fn validate(&self) -> Result<()> {
        let item_sum = self.work_item.sum();
        if (item_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(anyhow!(
                "complexity.work_item weights must sum to 1.0 (got {item_sum})"
            ));
        }
        let goal_sum = self.goal.sum();
        if (goal_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(anyhow!(
                "complexity.goal weights must sum to 1.0 (got {goal_sum})"
            ));
        }
        if self.simple_max >= self.medium_max || self.medium_max >= 100 {
            return Err(anyhow!(
                "complexity thresholds must satisfy simple_max < medium_max < 100"
            ));
        }
        Ok(())
    }
}

/// Deterministic scorer; identical inputs always produce identical scores.
#[derive(Debug, Clone, Default)]
pub struct ComplexityScorer {
    config: ComplexityConfig,
}

impl ComplexityScorer {
    pub fn new(config: ComplexityConfig) -> Self {
        Self { config }
    }

    pub fn score_work_item(&self, item: &WorkItem) -> ComplexityScore {
        let w = &self.config.work_item;
        self.combine(vec![
            factor("item_type", item_type_value(item.item_type), w.item_type),
            factor(
                "estimated_effort",
                effort_value(item.estimated_effort),
                w.estimated_effort,
            ),
            factor(
                "dependencies",
                dependency_value(item.dependencies.len()),
                w.dependencies,
            ),
            factor(
                "description_length",
                description_value(item.description.chars().count()),
                w.description_length,
            ),
            factor("retry_count", retry_value(item.retry_count), w.retry_count),
            factor("priority", priority_value(item.priority), w.priority),
        ])
    }

    pub fn score_goal(&self, goal: &Goal) -> ComplexityScore {
        let w = &self.config.goal;
        self.combine(vec![
            factor(
                "description_length",
                description_value(goal.description.chars().count()),
                w.description_length,
            ),
            factor(
                "success_criteria",
                criteria_value(goal.success_criteria.len()),
                w.success_criteria,
            ),
            factor("priority", priority_value(goal.priority), w.priority),
            factor("budget", budget_value(goal.budget_tokens), w.budget),
        ])
    }

    pub fn tier_for(&self, score: u8) -> ComplexityTier {
        if score <= self.config.simple_max {
            ComplexityTier::Simple
        } else if score <= self.config.medium_max {
            ComplexityTier::Medium
        } else {
            ComplexityTier::Complex
        }
    }

    fn combine(&self, factors: Vec<ComplexityFactor>) -> ComplexityScore {
        let total: f64 = factors.iter().map(|f| f.contribution).sum();
        let score = total.round().clamp(0.0, 100.0) as u8;
        ComplexityScore {
            score,
            tier: self.tier_for(score),
            factors,
        }
    }
}

fn factor(name: &'static str, value: f64, weight: f64) -> ComplexityFactor {
    ComplexityFactor {
        name,
        value,
        weight,
        contribution: value * weight,
    }
}

fn item_type_value(item_type: ItemType) -> f64 {
    match item_type {
        ItemType::Doc => 20.0,
        ItemType::Test => 35.0,
        ItemType::Code => 50.0,
        ItemType::Refactor => 55.0,
        ItemType::Research => 60.0,
        ItemType::Analysis => 70.0,
        ItemType::Design => 75.0,
    }
}

fn effort_value(effort: Effort) -> f64 {
    match effort {
        Effort::S => 20.0,
        Effort::M => 50.0,
        Effort::L => 80.0,
        Effort::XL => 100.0,
    }
}

fn dependency_value(count: usize) -> f64 {
    match count {
        0 => 0.0,
        1..=2 => 30.0,
        3..=4 => 60.0,
        _ => 100.0,
    }
}

fn description_value(chars: usize) -> f64 {
    match chars {
        0..300 => 20.0,
        300..800 => 50.0,
        800..1200 => 75.0,
        _ => 100.0,
    }
}

fn retry_value(retries: u32) -> f64 {
    match retries {
        0 => 0.0,
        1 => 50.0,
        2 => 75.0,
        _ => 100.0,
    }
}

fn priority_value(priority: u8) -> f64 {
    f64::from(priority.min(100))
}

fn criteria_value(count: usize) -> f64 {
    match count {
        0..=1 => 20.0,
        2..=3 => 40.0,
        4..=5 => 70.0,
        _ => 100.0,
    }
}

/// Larger token budgets signal larger goals; an unlimited budget sits in the
/// middle.
fn budget_value(budget_tokens: Option<u64>) -> f64 {
    match budget_tokens {
        None => 50.0,
        Some(0..10_000) => 20.0,
        Some(10_000..50_000) => 40.0,
        Some(50_000..200_000) => 70.0,
        Some(_) => 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{goal, item_with_deps, work_item};

    fn scorer() -> ComplexityScorer {
        ComplexityScorer::default()
    }

    #[test]
    fn default_weights_are_valid() {
        ComplexityConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut config = ComplexityConfig::default();
        config.work_item.priority = 0.5;
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn score_is_rounded_weighted_sum() {
        // code=50*0.2 + M=50*0.25 + deps0 + short=20*0.15 + retries0 + prio50*0.15
        // = 10 + 12.5 + 0 + 3 + 0 + 7.5 = 33
        let item = work_item("a", "g");
        let scored = scorer().score_work_item(&item);
        assert_eq!(scored.score, 33);
        assert_eq!(scored.tier, ComplexityTier::Simple);
        assert_eq!(scored.factors.len(), 6);
        let sum: f64 = scored.factors.iter().map(|f| f.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn retries_never_decrease_score() {
        let s = scorer();
        let mut item = item_with_deps("a", "g", &["b", "c"]);
        let mut last = 0;
        for retries in 0..=3 {
            item.retry_count = retries;
            let score = s.score_work_item(&item).score;
            assert!(score >= last, "retry {retries} dropped score");
            last = score;
        }
    }

    #[test]
    fn tiers_follow_thresholds() {
        let s = scorer();
        assert_eq!(s.tier_for(35), ComplexityTier::Simple);
        assert_eq!(s.tier_for(36), ComplexityTier::Medium);
        assert_eq!(s.tier_for(65), ComplexityTier::Medium);
        assert_eq!(s.tier_for(66), ComplexityTier::Complex);
    }

    #[test]
    fn heavy_item_is_complex() {
        let mut item = item_with_deps("a", "g", &["b", "c", "d", "e", "f"]);
        item.item_type = ItemType::Design;
        item.estimated_effort = Effort::XL;
        item.description = "x".repeat(1_500);
        item.retry_count = 3;
        item.priority = 100;
        let scored = scorer().score_work_item(&item);
        assert_eq!(scored.tier, ComplexityTier::Complex);
    }

    #[test]
    fn goal_score_uses_planning_factors() {
        let g = goal("g");
        let scored = scorer().score_goal(&g);
        let names: Vec<&str> = scored.factors.iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            vec!["description_length", "success_criteria", "priority", "budget"]
        );
        // short=20*0.3 + one criterion=20*0.3 + prio50*0.15 + unlimited=50*0.25 = 32
        assert_eq!(scored.score, 32);
    }

    #[test]
    fn buckets_are_monotonic() {
        let counts = [0, 1, 2, 3, 4, 5, 9];
        let deps: Vec<f64> = counts.iter().map(|c| dependency_value(*c)).collect();
        assert!(deps.windows(2).all(|pair| pair[0] <= pair[1]));

        let lengths = [0, 299, 300, 799, 800, 1_199, 1_200, 5_000];
        let desc: Vec<f64> = lengths.iter().map(|l| description_value(*l)).collect();
        assert!(desc.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(desc.last().copied(), Some(100.0));
    }
}
