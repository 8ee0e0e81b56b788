//! Goal budget accounting: remaining spend, warning levels, and overage
//! projection.
//!
//! The tracker classifies spend and forwards usage to a per-goal sink. It
//! never writes to persistence itself and never cancels work.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Effort, Goal, UsageDelta, WorkItem};

/// Threshold and overage policy for budget classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Fraction of a limit at which spend is a `warning`.
    pub warning_threshold: f64,
    /// Fraction of a limit at which spend is `critical`.
    pub critical_threshold: f64,
    /// Permit projected spend beyond the limit by `max_overage_percent`.
    pub allow_overage: bool,
    pub max_overage_percent: f64,
    /// Token estimates per effort size used for pre-dispatch projection.
    pub effort_tokens: EffortTokens,
    pub cost_per_1k_tokens_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffortTokens {
    pub s: u64,
    pub m: u64,
    pub l: u64,
    pub xl: u64,
}

impl Default for EffortTokens {
    fn default() -> Self {
        Self {
            s: 2_000,
            m: 8_000,
            l: 20_000,
            xl: 50_000,
        }
    }
}

impl EffortTokens {
    pub fn for_effort(&self, effort: Effort) -> u64 {
        match effort {
            Effort::S => self.s,
            Effort::M => self.m,
            Effort::L => self.l,
            Effort::XL => self.xl,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.7,
            critical_threshold: 0.9,
            allow_overage: false,
            max_overage_percent: 10.0,
            effort_tokens: EffortTokens::default(),
            cost_per_1k_tokens_usd: 0.01,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.warning_threshold && self.warning_threshold < self.critical_threshold) {
            return Err(anyhow!(
                "budget.warning_threshold must be > 0 and < critical_threshold"
            ));
        }
        if self.critical_threshold > 1.0 {
            return Err(anyhow!("budget.critical_threshold must be <= 1.0"));
        }
        if self.max_overage_percent < 0.0 {
            return Err(anyhow!("budget.max_overage_percent must be >= 0"));
        }
        if self.cost_per_1k_tokens_usd < 0.0 {
            return Err(anyhow!("budget.cost_per_1k_tokens_usd must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Tokens,
    TimeMinutes,
    CostUsd,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Resource::Tokens => "tokens",
            Resource::TimeMinutes => "time_minutes",
            Resource::CostUsd => "cost_usd",
        };
        f.write_str(label)
    }
}

/// Ordered by severity: `None < Warning < Critical < Exceeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    None,
    Warning,
    Critical,
    Exceeded,
}

/// Spend for one resource. `remaining` is `None` when the resource is
/// unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub limit: Option<f64>,
    pub spent: f64,
    pub remaining: Option<f64>,
}

impl ResourceBudget {
    fn new(limit: Option<f64>, spent: f64) -> Self {
        Self {
            limit,
            spent,
            remaining: limit.map(|limit| (limit - spent).max(0.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetInfo {
    pub tokens: ResourceBudget,
    pub time_minutes: ResourceBudget,
    pub cost_usd: ResourceBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub info: BudgetInfo,
    pub tokens: WarningLevel,
    pub time_minutes: WarningLevel,
    pub cost_usd: WarningLevel,
    /// Highest severity across all resources.
    pub overall: WarningLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub resource: Resource,
    pub limit: f64,
    pub spent: f64,
    pub message: String,
}

/// Usage attributed to one run. `run_id` makes recording idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub run_id: String,
    pub delta: UsageDelta,
}

/// Projected cost of dispatching a work item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageEstimate {
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Persists a usage delta for one goal.
pub type UsageSink = Arc<dyn Fn(&UsageDelta) -> Result<()> + Send + Sync>;

pub struct BudgetTracker {
    config: BudgetConfig,
    sinks: Mutex<HashMap<String, UsageSink>>,
    /// Run ids already charged, per goal.
    recorded_runs: Mutex<HashMap<String, HashSet<String>>>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            sinks: Mutex::new(HashMap::new()),
            recorded_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn budget_info(&self, goal: &Goal) -> BudgetInfo {
        BudgetInfo {
            tokens: ResourceBudget::new(
                goal.budget_tokens.map(|limit| limit as f64),
                goal.spent_tokens as f64,
            ),
            time_minutes: ResourceBudget::new(goal.budget_time_minutes, goal.spent_time_minutes),
            cost_usd: ResourceBudget::new(goal.budget_cost_usd, goal.spent_cost_usd),
        }
    }

    pub fn budget_status(&self, goal: &Goal) -> BudgetStatus {
        let info = self.budget_info(goal);
        let tokens = self.level(&info.tokens);
        let time_minutes = self.level(&info.time_minutes);
        let cost_usd = self.level(&info.cost_usd);
        BudgetStatus {
            info,
            tokens,
            time_minutes,
            cost_usd,
            overall: tokens.max(time_minutes).max(cost_usd),
        }
    }

    /// Classify one resource against the configured thresholds.
    pub fn level(&self, budget: &ResourceBudget) -> WarningLevel {
        let Some(limit) = budget.limit else {
            return WarningLevel::None;
        };
        if limit <= 0.0 {
            return if budget.spent > 0.0 {
                WarningLevel::Exceeded
            } else {
                WarningLevel::None
            };
        }
        let ratio = budget.spent / limit;
        if ratio >= 1.0 {
            WarningLevel::Exceeded
        } else if ratio >= self.config.critical_threshold {
            WarningLevel::Critical
        } else if ratio >= self.config.warning_threshold {
            WarningLevel::Warning
        } else {
            WarningLevel::None
        }
    }

    /// Report every resource whose spend is above its limit.
    pub fn check_budget(&self, goal: &Goal) -> Vec<BudgetViolation> {
        let info = self.budget_info(goal);
        [
            (Resource::Tokens, info.tokens),
            (Resource::TimeMinutes, info.time_minutes),
            (Resource::CostUsd, info.cost_usd),
        ]
        .into_iter()
        .filter_map(|(resource, budget)| {
            let limit = budget.limit?;
            if budget.spent <= limit {
                return None;
            }
            Some(BudgetViolation {
                resource,
                limit,
                spent: budget.spent,
                message: format!(
                    "{} spent {} exceeds budget {}",
                    resource, budget.spent, limit
                ),
            })
        })
        .collect()
    }

    /// Project spend forward before committing resources.
    ///
    /// With `allow_overage`, the effective limit grows by
    /// `max_overage_percent`.
    pub fn will_exceed_budget(&self, goal: &Goal, est_tokens: u64, est_cost: f64) -> bool {
        let info = self.budget_info(goal);
        self.projects_over(&info.tokens, est_tokens as f64)
            || self.projects_over(&info.cost_usd, est_cost)
    }

    fn projects_over(&self, budget: &ResourceBudget, estimate: f64) -> bool {
        let Some(limit) = budget.limit else {
            return false;
        };
        let effective = if self.config.allow_overage {
            limit * (1.0 + self.config.max_overage_percent / 100.0)
        } else {
            limit
        };
        budget.spent + estimate > effective
    }

    pub fn estimate_usage(&self, item: &WorkItem) -> UsageEstimate {
        let tokens = self.config.effort_tokens.for_effort(item.estimated_effort);
        UsageEstimate {
            tokens,
            cost_usd: tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens_usd,
        }
    }

    /// Register the sink that persists usage for `goal_id`, replacing any
    /// previous one.
    pub fn register_usage_sink(&self, goal_id: &str, sink: UsageSink) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.insert(goal_id.to_string(), sink);
    }

    pub fn unregister_usage_sink(&self, goal_id: &str) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.remove(goal_id);
        let mut recorded = self.recorded_runs.lock().unwrap_or_else(|e| e.into_inner());
        recorded.remove(goal_id);
    }

    pub fn has_usage_sink(&self, goal_id: &str) -> bool {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.contains_key(goal_id)
    }

    /// Forward a run's usage to the goal's sink.
    ///
    /// Returns `Ok(false)` when the run was already recorded. Negative or
    /// non-finite deltas are rejected; usage is strictly additive.
    pub fn record_usage(&self, goal_id: &str, usage: &UsageRecord) -> Result<bool> {
        let delta = &usage.delta;
        if !(delta.time_minutes.is_finite() && delta.time_minutes >= 0.0) {
            return Err(anyhow!(
                "usage time_minutes {} must be >= 0",
                delta.time_minutes
            ));
        }
        if !(delta.cost_usd.is_finite() && delta.cost_usd >= 0.0) {
            return Err(anyhow!("usage cost_usd {} must be >= 0", delta.cost_usd));
        }

        let sink = {
            let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            sinks
                .get(goal_id)
                .cloned()
                .ok_or_else(|| anyhow!("no usage sink registered for goal '{goal_id}'"))?
        };

        // Claim the run id before charging so concurrent records of the same
        // run cannot both reach the sink.
        {
            let mut recorded = self.recorded_runs.lock().unwrap_or_else(|e| e.into_inner());
            if !recorded
                .entry(goal_id.to_string())
                .or_default()
                .insert(usage.run_id.clone())
            {
                debug!(goal_id, run_id = %usage.run_id, "usage already recorded");
                return Ok(false);
            }
        }

        if let Err(err) = sink(delta) {
            let mut recorded = self.recorded_runs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(runs) = recorded.get_mut(goal_id) {
                runs.remove(&usage.run_id);
            }
            return Err(err);
        }
        debug!(
            goal_id,
            run_id = %usage.run_id,
            tokens = delta.tokens,
            cost_usd = delta.cost_usd,
            "usage recorded"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_support::goal;

    fn tracker() -> BudgetTracker {
        BudgetTracker::new(BudgetConfig::default())
    }

    #[test]
    fn unlimited_resources_have_no_remaining() {
        let info = tracker().budget_info(&goal("g"));
        assert_eq!(info.tokens.remaining, None);
        assert_eq!(info.cost_usd.remaining, None);
    }

    #[test]
    fn remaining_never_goes_negative() {
        let mut g = goal("g");
        g.budget_tokens = Some(100);
        g.spent_tokens = 150;
        let info = tracker().budget_info(&g);
        assert_eq!(info.tokens.remaining, Some(0.0));
    }

    #[test]
    fn levels_follow_thresholds() {
        let t = tracker();
        let at = |spent: f64| {
            t.level(&ResourceBudget {
                limit: Some(100.0),
                spent,
                remaining: None,
            })
        };
        assert_eq!(at(69.0), WarningLevel::None);
        assert_eq!(at(70.0), WarningLevel::Warning);
        assert_eq!(at(90.0), WarningLevel::Critical);
        assert_eq!(at(100.0), WarningLevel::Exceeded);
    }

    #[test]
    fn zero_limit_is_exceeded_only_after_spend() {
        let t = tracker();
        let zero = |spent: f64| {
            t.level(&ResourceBudget {
                limit: Some(0.0),
                spent,
                remaining: None,
            })
        };
        assert_eq!(zero(0.0), WarningLevel::None);
        assert_eq!(zero(0.5), WarningLevel::Exceeded);
    }

    /// Overall level is the max across resources, not the first or the mean.
    #[test]
    fn overall_level_is_max_across_resources() {
        let mut g = goal("g");
        g.budget_tokens = Some(1_000);
        g.spent_tokens = 950;
        g.budget_cost_usd = Some(10.0);
        g.spent_cost_usd = 5.0;
        let status = tracker().budget_status(&g);
        assert_eq!(status.tokens, WarningLevel::Critical);
        assert_eq!(status.cost_usd, WarningLevel::None);
        assert_eq!(status.overall, WarningLevel::Critical);
    }

    #[test]
    fn check_budget_reports_overspend() {
        let mut g = goal("g");
        g.budget_cost_usd = Some(1.0);
        g.spent_cost_usd = 1.5;
        let violations = tracker().check_budget(&g);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].resource, Resource::CostUsd);
        assert_eq!(violations[0].message, "cost_usd spent 1.5 exceeds budget 1");
    }

    #[test]
    fn will_exceed_honors_overage_policy() {
        let mut g = goal("g");
        g.budget_tokens = Some(1_000);
        g.spent_tokens = 900;

        let strict = tracker();
        assert!(!strict.will_exceed_budget(&g, 100, 0.0));
        assert!(strict.will_exceed_budget(&g, 150, 0.0));

        let lenient = BudgetTracker::new(BudgetConfig {
            allow_overage: true,
            ..BudgetConfig::default()
        });
        assert!(!lenient.will_exceed_budget(&g, 150, 0.0));
        assert!(lenient.will_exceed_budget(&g, 250, 0.0));
    }

    #[test]
    fn record_usage_is_additive_and_idempotent_per_run() {
        let t = tracker();
        let total = Arc::new(Mutex::new(UsageDelta::default()));
        let sink_total = total.clone();
        t.register_usage_sink(
            "g",
            Arc::new(move |delta: &UsageDelta| -> Result<()> {
                let mut total = sink_total.lock().expect("lock");
                total.tokens += delta.tokens;
                total.cost_usd += delta.cost_usd;
                total.time_minutes += delta.time_minutes;
                Ok(())
            }),
        );

        let mut last_tokens = 0;
        for (run, tokens) in [("r1", 10), ("r2", 0), ("r3", 25)] {
            let record = UsageRecord {
                run_id: run.to_string(),
                delta: UsageDelta {
                    tokens,
                    time_minutes: 0.5,
                    cost_usd: 0.1,
                },
            };
            assert!(t.record_usage("g", &record).expect("record"));
            let current = total.lock().expect("lock").tokens;
            assert!(current >= last_tokens);
            last_tokens = current;
        }

        let duplicate = UsageRecord {
            run_id: "r3".to_string(),
            delta: UsageDelta {
                tokens: 25,
                time_minutes: 0.5,
                cost_usd: 0.1,
            },
        };
        assert!(!t.record_usage("g", &duplicate).expect("record"));
        assert_eq!(total.lock().expect("lock").tokens, 35);
    }

    fn counting_sink(calls: &Arc<AtomicUsize>, fail: bool) -> UsageSink {
        let calls = Arc::clone(calls);
        Arc::new(move |_: &UsageDelta| -> Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                return Err(anyhow!("store unavailable"));
            }
            Ok(())
        })
    }

    fn usage(run_id: &str) -> UsageRecord {
        UsageRecord {
            run_id: run_id.to_string(),
            delta: UsageDelta {
                tokens: 10,
                ..UsageDelta::default()
            },
        }
    }

    #[test]
    fn concurrent_records_of_one_run_charge_once() {
        let t = tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        t.register_usage_sink("g", counting_sink(&calls, false));

        let charged = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| t.record_usage("g", &usage("r1")).expect("record")))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .filter(|charged| *charged)
                .count()
        });
        assert_eq!(charged, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_sink_does_not_mark_run_recorded() {
        let t = tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        t.register_usage_sink("g", counting_sink(&calls, true));
        assert!(t.record_usage("g", &usage("r1")).is_err());

        t.register_usage_sink("g", counting_sink(&calls, false));
        assert!(t.record_usage("g", &usage("r1")).expect("retry"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregistering_forgets_recorded_runs() {
        let t = tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        t.register_usage_sink("g", counting_sink(&calls, false));
        assert!(t.record_usage("g", &usage("r1")).expect("record"));
        t.unregister_usage_sink("g");
        assert!(t.recorded_runs.lock().expect("lock").is_empty());
    }

    #[test]
    fn record_usage_rejects_negative_delta() {
        let t = tracker();
        t.register_usage_sink("g", Arc::new(|_: &UsageDelta| -> Result<()> { Ok(()) }));
        let record = UsageRecord {
            run_id: "r".to_string(),
            delta: UsageDelta {
                tokens: 1,
                time_minutes: 0.0,
                cost_usd: -0.5,
            },
        };
        let err = t.record_usage("g", &record).expect_err("negative");
        assert!(err.to_string().contains("cost_usd"));
    }

    #[test]
    fn record_usage_requires_registered_sink() {
        let record = UsageRecord {
            run_id: "r".to_string(),
            delta: UsageDelta::default(),
        };
        let err = tracker().record_usage("g", &record).expect_err("no sink");
        assert!(err.to_string().contains("no usage sink"));
    }
}
