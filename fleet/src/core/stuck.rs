//! Stuck detection for work items and runs.
//!
//! The detector only reports. It never writes to the repository and never
//! cancels a run; the daemon decides what to do with each detection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::graph::{find_cycles, index_items};
use crate::core::signature::error_signature;
use crate::model::{EscalationType, Run, RunStatus, Severity, WorkItem, WorkItemStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckConfig {
    pub max_in_progress_duration_ms: u64,
    pub max_ready_duration_ms: u64,
    pub max_same_error_retries: u32,
    pub max_total_retries: u32,
    pub check_interval_ms: u64,
    pub auto_escalate: bool,
    pub acknowledge_cooldown_ms: u64,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            max_in_progress_duration_ms: 30 * 60 * 1000,
            max_ready_duration_ms: 60 * 60 * 1000,
            max_same_error_retries: 3,
            max_total_retries: 5,
            check_interval_ms: 60 * 1000,
            auto_escalate: true,
            acknowledge_cooldown_ms: 30 * 60 * 1000,
        }
    }
}

impl StuckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_progress_duration_ms == 0 || self.max_ready_duration_ms == 0 {
            return Err(anyhow!("stuck durations must be > 0"));
        }
        if self.max_same_error_retries == 0 || self.max_total_retries == 0 {
            return Err(anyhow!("stuck retry thresholds must be > 0"));
        }
        if self.check_interval_ms == 0 {
            return Err(anyhow!("stuck.check_interval_ms must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    TimeoutInProgress,
    RunTimeout,
    TimeoutReady,
    RepeatedSameError,
    MaxRetriesExceeded,
    CircularDependency,
    MissingDependency,
    NoProgress,
}

impl StuckReason {
    pub fn escalation_type(self) -> EscalationType {
        match self {
            StuckReason::CircularDependency => EscalationType::CircularDependency,
            StuckReason::MissingDependency => EscalationType::MissingDependency,
            StuckReason::RunTimeout | StuckReason::TimeoutInProgress => EscalationType::Timeout,
            _ => EscalationType::Stuck,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            StuckReason::CircularDependency | StuckReason::MissingDependency => Severity::Critical,
            StuckReason::RepeatedSameError | StuckReason::MaxRetriesExceeded => Severity::High,
            StuckReason::RunTimeout | StuckReason::TimeoutInProgress => Severity::Medium,
            StuckReason::TimeoutReady | StuckReason::NoProgress => Severity::Low,
        }
    }
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StuckReason::TimeoutInProgress => "timeout_in_progress",
            StuckReason::RunTimeout => "run_timeout",
            StuckReason::TimeoutReady => "timeout_ready",
            StuckReason::RepeatedSameError => "repeated_same_error",
            StuckReason::MaxRetriesExceeded => "max_retries_exceeded",
            StuckReason::CircularDependency => "circular_dependency",
            StuckReason::MissingDependency => "missing_dependency",
            StuckReason::NoProgress => "no_progress",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckAction {
    Retry,
    Reassign,
    Escalate,
    UnblockDependency,
    ChangeApproach,
}

impl fmt::Display for StuckAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StuckAction::Retry => "retry",
            StuckAction::Reassign => "reassign",
            StuckAction::Escalate => "escalate",
            StuckAction::UnblockDependency => "unblock_dependency",
            StuckAction::ChangeApproach => "change_approach",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckDetection {
    pub work_item_id: String,
    pub goal_id: String,
    pub run_id: Option<String>,
    pub reason: StuckReason,
    pub action: StuckAction,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPattern {
    pub signature: String,
    pub count: u32,
}

/// Failure signatures across every run of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPatternAnalysis {
    pub work_item_id: String,
    pub total_failures: u32,
    /// Sorted by count descending, then signature.
    pub patterns: Vec<ErrorPattern>,
    pub is_repeating: bool,
}

impl ErrorPatternAnalysis {
    pub fn dominant(&self) -> Option<&ErrorPattern> {
        self.patterns.first()
    }
}

#[derive(Debug, Default)]
pub struct StuckDetector {
    config: StuckConfig,
    acknowledged: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StuckDetector {
    pub fn new(config: StuckConfig) -> Self {
        Self {
            config,
            acknowledged: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StuckConfig {
        &self.config
    }

    /// Item-level checks. `runs` are the item's runs; `all_items` is the
    /// item's goal, used for dependency checks. Terminal and blocked items
    /// are never reported.
    pub fn check_work_item(
        &self,
        item: &WorkItem,
        runs: &[Run],
        all_items: &[WorkItem],
        now: DateTime<Utc>,
    ) -> Vec<StuckDetection> {
        if item.status.is_terminal() || item.status == WorkItemStatus::Blocked {
            return Vec::new();
        }
        let mut found = Vec::new();
        let detect = |reason, action, message: String| StuckDetection {
            work_item_id: item.id.clone(),
            goal_id: item.goal_id.clone(),
            run_id: None,
            reason,
            action,
            message,
            detected_at: now,
        };

        if let Some(cycle) = find_cycles(all_items)
            .into_iter()
            .find(|cycle| cycle.contains(&item.id))
        {
            found.push(detect(
                StuckReason::CircularDependency,
                StuckAction::Escalate,
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        let index = index_items(all_items);
        let missing: Vec<&str> = item
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|dep| !index.contains_key(dep))
            .collect();
        if !missing.is_empty() {
            found.push(detect(
                StuckReason::MissingDependency,
                StuckAction::UnblockDependency,
                format!("missing dependencies: {}", missing.join(", ")),
            ));
        }

        // A ready item at the limit still has its final attempt ahead, and an
        // in-progress item is that attempt; the daemon escalates after it.
        let retry_limit = item.max_retries.min(self.config.max_total_retries);
        if item.status != WorkItemStatus::InProgress && item.retry_count > retry_limit {
            found.push(detect(
                StuckReason::MaxRetriesExceeded,
                StuckAction::Escalate,
                format!("retried {} times (limit {})", item.retry_count, retry_limit),
            ));
        }

        let analysis = self.analyze_error_patterns(&item.id, runs);
        if let Some(pattern) = analysis.dominant().filter(|_| analysis.is_repeating) {
            found.push(detect(
                StuckReason::RepeatedSameError,
                StuckAction::Escalate,
                format!("same error {} times: {}", pattern.count, pattern.signature),
            ));
        }

        let in_state = elapsed_ms(item.updated_at, now);
        let has_running = runs.iter().any(|run| run.status == RunStatus::Running);
        if item.status == WorkItemStatus::InProgress
            && !has_running
            && in_state > self.config.max_in_progress_duration_ms
        {
            found.push(detect(
                StuckReason::TimeoutInProgress,
                StuckAction::Retry,
                format!("in_progress for {}ms without a running run", in_state),
            ));
        }
        if item.status == WorkItemStatus::Ready && in_state > self.config.max_ready_duration_ms {
            found.push(detect(
                StuckReason::TimeoutReady,
                StuckAction::Reassign,
                format!("ready for {}ms without dispatch", in_state),
            ));
        }

        let completed: Vec<&Run> = runs
            .iter()
            .filter(|run| run.status != RunStatus::Running)
            .collect();
        if completed.len() >= 2 && completed.iter().all(|run| run.artifacts.is_empty()) {
            found.push(detect(
                StuckReason::NoProgress,
                StuckAction::ChangeApproach,
                format!("{} runs produced no artifacts", completed.len()),
            ));
        }

        found
    }

    /// A `running` run older than the in-progress limit.
    pub fn check_run(
        &self,
        run: &Run,
        item: &WorkItem,
        now: DateTime<Utc>,
    ) -> Option<StuckDetection> {
        if run.status != RunStatus::Running {
            return None;
        }
        let running_for = elapsed_ms(run.started_at, now);
        if running_for <= self.config.max_in_progress_duration_ms {
            return None;
        }
        // A timed-out run costs a retry, so the final attempt escalates.
        let action = if item.retries_exhausted() {
            StuckAction::Escalate
        } else {
            StuckAction::Retry
        };
        Some(StuckDetection {
            work_item_id: item.id.clone(),
            goal_id: item.goal_id.clone(),
            run_id: Some(run.id.clone()),
            reason: StuckReason::RunTimeout,
            action,
            message: format!("run {} running for {}ms", run.run_sequence, running_for),
            detected_at: now,
        })
    }

    pub fn analyze_error_patterns(&self, work_item_id: &str, runs: &[Run]) -> ErrorPatternAnalysis {
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        let mut total_failures = 0;
        for run in runs {
            if run.work_item_id != work_item_id || run.status != RunStatus::Failure {
                continue;
            }
            total_failures += 1;
            if let Some(message) = run.error_message.as_deref() {
                *counts.entry(error_signature(message)).or_insert(0) += 1;
            }
        }
        let mut patterns: Vec<ErrorPattern> = counts
            .into_iter()
            .map(|(signature, count)| ErrorPattern { signature, count })
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.signature.cmp(&b.signature)));
        let is_repeating = patterns
            .first()
            .is_some_and(|p| p.count >= self.config.max_same_error_retries);
        ErrorPatternAnalysis {
            work_item_id: work_item_id.to_string(),
            total_failures,
            patterns,
            is_repeating,
        }
    }

    /// Every dependency cycle among one goal's items.
    pub fn detect_circular_dependencies(
        &self,
        goal_id: &str,
        items: &[WorkItem],
    ) -> Vec<Vec<String>> {
        let scoped: Vec<WorkItem> = items
            .iter()
            .filter(|item| item.goal_id == goal_id)
            .cloned()
            .collect();
        find_cycles(&scoped)
    }

    /// Suppress detections for `work_item_id` until the cool-down passes.
    /// `duration_ms` defaults to the configured cool-down.
    pub fn acknowledge_stuck(&self, work_item_id: &str, duration_ms: Option<u64>, now: DateTime<Utc>) {
        let ms = duration_ms.unwrap_or(self.config.acknowledge_cooldown_ms);
        let until = now + Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
        self.acks().insert(work_item_id.to_string(), until);
    }

    pub fn is_acknowledged(&self, work_item_id: &str, now: DateTime<Utc>) -> bool {
        let mut acks = self.acks();
        match acks.get(work_item_id) {
            Some(until) if *until > now => true,
            Some(_) => {
                acks.remove(work_item_id);
                false
            }
            None => false,
        }
    }

    /// Every check for one goal, skipping acknowledged items.
    pub fn scan_goal(
        &self,
        goal_id: &str,
        items: &[WorkItem],
        runs: &[Run],
        now: DateTime<Utc>,
    ) -> Vec<StuckDetection> {
        let scoped: Vec<WorkItem> = items
            .iter()
            .filter(|item| item.goal_id == goal_id)
            .cloned()
            .collect();
        let mut runs_by_item: HashMap<&str, Vec<Run>> = HashMap::new();
        for run in runs {
            runs_by_item
                .entry(run.work_item_id.as_str())
                .or_default()
                .push(run.clone());
        }

        let mut detections = Vec::new();
        let mut seen = HashSet::new();
        for item in &scoped {
            if !seen.insert(item.id.as_str()) || self.is_acknowledged(&item.id, now) {
                continue;
            }
            let item_runs = runs_by_item
                .get(item.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            detections.extend(self.check_work_item(item, item_runs, &scoped, now));
            if item.status == WorkItemStatus::InProgress {
                detections.extend(
                    item_runs
                        .iter()
                        .filter_map(|run| self.check_run(run, item, now)),
                );
            }
        }
        detections
    }

    fn acks(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.acknowledged.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - since).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_time, item_with_deps, item_with_status, run_record};

    fn detector() -> StuckDetector {
        StuckDetector::new(StuckConfig::default())
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        fixed_time() + Duration::minutes(n)
    }

    fn reasons(detections: &[StuckDetection]) -> Vec<StuckReason> {
        detections.iter().map(|d| d.reason).collect()
    }

    fn failed_run(id: &str, item: &WorkItem, message: &str) -> Run {
        let mut run = run_record(id, item, RunStatus::Failure);
        run.error_message = Some(message.to_string());
        run
    }

    #[test]
    fn fresh_item_is_not_stuck() {
        let item = item_with_status("a", "g", WorkItemStatus::Ready);
        let items = vec![item.clone()];
        assert!(detector().check_work_item(&item, &[], &items, minutes(5)).is_empty());
    }

    #[test]
    fn ready_too_long_suggests_reassign() {
        let item = item_with_status("a", "g", WorkItemStatus::Ready);
        let items = vec![item.clone()];
        let found = detector().check_work_item(&item, &[], &items, minutes(61));
        assert_eq!(reasons(&found), vec![StuckReason::TimeoutReady]);
        assert_eq!(found[0].action, StuckAction::Reassign);
    }

    #[test]
    fn in_progress_without_run_suggests_retry() {
        let item = item_with_status("a", "g", WorkItemStatus::InProgress);
        let items = vec![item.clone()];
        let found = detector().check_work_item(&item, &[], &items, minutes(31));
        assert_eq!(reasons(&found), vec![StuckReason::TimeoutInProgress]);
        assert_eq!(found[0].action, StuckAction::Retry);
    }

    #[test]
    fn long_running_run_times_out() {
        let item = item_with_status("a", "g", WorkItemStatus::InProgress);
        let run = run_record("r1", &item, RunStatus::Running);
        let d = detector();
        assert!(d.check_run(&run, &item, minutes(10)).is_none());
        let found = d.check_run(&run, &item, minutes(31)).expect("timeout");
        assert_eq!(found.reason, StuckReason::RunTimeout);
        assert_eq!(found.action, StuckAction::Retry);
        assert_eq!(found.run_id.as_deref(), Some("r1"));

        let mut last_try = item.clone();
        last_try.retry_count = 2;
        let found = d.check_run(&run, &last_try, minutes(31)).expect("timeout");
        assert_eq!(found.action, StuckAction::Retry);
        last_try.retry_count = 3;
        let found = d.check_run(&run, &last_try, minutes(31)).expect("timeout");
        assert_eq!(found.action, StuckAction::Escalate);
    }

    #[test]
    fn repeated_error_signature_escalates() {
        let item = item_with_status("a", "g", WorkItemStatus::Ready);
        let runs = vec![
            failed_run("r1", &item, "connection refused on port 8080"),
            failed_run("r2", &item, "Connection refused on port 9090"),
            failed_run("r3", &item, "connection refused on port 7070"),
        ];
        let d = detector();
        let analysis = d.analyze_error_patterns("a", &runs);
        assert!(analysis.is_repeating);
        assert_eq!(analysis.total_failures, 3);
        assert_eq!(
            analysis.dominant().map(|p| p.signature.as_str()),
            Some("connection refused on port <n>")
        );

        let items = vec![item.clone()];
        let found = d.check_work_item(&item, &runs, &items, minutes(1));
        assert!(found.iter().any(|f| f.reason == StuckReason::RepeatedSameError
            && f.action == StuckAction::Escalate));
    }

    #[test]
    fn exhausted_retries_escalate() {
        let mut item = item_with_status("a", "g", WorkItemStatus::Ready);
        item.retry_count = 4;
        let items = vec![item.clone()];
        let found = detector().check_work_item(&item, &[], &items, minutes(1));
        assert_eq!(reasons(&found), vec![StuckReason::MaxRetriesExceeded]);
    }

    /// `retry_count == max_retries` is the final attempt, not yet exhaustion.
    #[test]
    fn final_attempt_is_not_flagged() {
        let d = detector();
        let mut item = item_with_status("a", "g", WorkItemStatus::Ready);
        item.retry_count = 3;
        let items = vec![item.clone()];
        assert!(d.check_work_item(&item, &[], &items, minutes(1)).is_empty());

        item.status = WorkItemStatus::InProgress;
        item.retry_count = 9;
        let items = vec![item.clone()];
        assert!(d.check_work_item(&item, &[], &items, minutes(1)).is_empty());
    }

    #[test]
    fn dependency_problems_are_reported() {
        let items = vec![
            item_with_deps("a", "g", &["b"]),
            item_with_deps("b", "g", &["a"]),
            item_with_deps("c", "g", &["ghost"]),
        ];
        let d = detector();
        let a = d.check_work_item(&items[0], &[], &items, minutes(1));
        assert_eq!(reasons(&a), vec![StuckReason::CircularDependency]);
        let c = d.check_work_item(&items[2], &[], &items, minutes(1));
        assert_eq!(reasons(&c), vec![StuckReason::MissingDependency]);
        assert_eq!(c[0].action, StuckAction::UnblockDependency);
        assert_eq!(
            d.detect_circular_dependencies("g", &items),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[test]
    fn second_parent_cycle_flags_its_entry_item() {
        let items = vec![
            item_with_deps("a", "g", &["b", "c"]),
            item_with_deps("b", "g", &["a"]),
            item_with_deps("c", "g", &["b"]),
        ];
        let d = detector();
        let c = d.check_work_item(&items[2], &[], &items, minutes(1));
        assert_eq!(reasons(&c), vec![StuckReason::CircularDependency]);
        assert_eq!(c[0].action, StuckAction::Escalate);
        assert_eq!(d.detect_circular_dependencies("g", &items).len(), 2);
    }

    #[test]
    fn runs_without_artifacts_suggest_change_of_approach() {
        let item = item_with_status("a", "g", WorkItemStatus::Ready);
        let runs = vec![
            run_record("r1", &item, RunStatus::Success),
            run_record("r2", &item, RunStatus::Failure),
        ];
        let items = vec![item.clone()];
        let found = detector().check_work_item(&item, &runs, &items, minutes(1));
        assert_eq!(reasons(&found), vec![StuckReason::NoProgress]);
    }

    #[test]
    fn acknowledged_items_are_skipped_until_cooldown_ends() {
        let item = item_with_status("a", "g", WorkItemStatus::Ready);
        let items = vec![item];
        let d = detector();
        assert_eq!(d.scan_goal("g", &items, &[], minutes(61)).len(), 1);

        d.acknowledge_stuck("a", Some(10 * 60 * 1000), minutes(61));
        assert!(d.scan_goal("g", &items, &[], minutes(65)).is_empty());
        assert_eq!(d.scan_goal("g", &items, &[], minutes(72)).len(), 1);
    }

    #[test]
    fn terminal_items_are_ignored() {
        let mut item = item_with_status("a", "g", WorkItemStatus::Done);
        item.retry_count = 9;
        let items = vec![item.clone()];
        assert!(detector().check_work_item(&item, &[], &items, minutes(500)).is_empty());
    }
}
