//! In-process [`Repository`] backed by a mutex-guarded [`Snapshot`].
//!
//! When opened with a path, the state is loaded from that JSON snapshot and
//! written back atomically on `close`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::signature::error_signature;
use crate::io::repository::Repository;
use crate::io::snapshot::{Snapshot, load_snapshot, write_snapshot};
use crate::model::{
    Escalation, EscalationStatus, Goal, GoalStatus, NewEscalation, NewRun, Run, RunCompletion,
    RunStatus, UsageDelta, VerificationStatus, WorkItem, WorkItemStatus,
};

#[derive(Debug, Default)]
struct State {
    goals: BTreeMap<String, Goal>,
    work_items: BTreeMap<String, WorkItem>,
    runs: Vec<Run>,
    escalations: Vec<Escalation>,
    closed: bool,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            goals: snapshot
                .goals
                .into_iter()
                .map(|goal| (goal.id.clone(), goal))
                .collect(),
            work_items: snapshot
                .work_items
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect(),
            runs: snapshot.runs,
            escalations: snapshot.escalations,
            closed: false,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            goals: self.goals.values().cloned().collect(),
            work_items: self.work_items.values().cloned().collect(),
            runs: self.runs.clone(),
            escalations: self.escalations.clone(),
        }
    }

    fn goal_mut(&mut self, goal_id: &str) -> Result<&mut Goal> {
        self.goals
            .get_mut(goal_id)
            .ok_or_else(|| anyhow!("goal '{goal_id}' not found"))
    }

    fn item_mut(&mut self, work_item_id: &str) -> Result<&mut WorkItem> {
        self.work_items
            .get_mut(work_item_id)
            .ok_or_else(|| anyhow!("work item '{work_item_id}' not found"))
    }

    fn dependencies_done(&self, item: &WorkItem) -> bool {
        item.dependencies.iter().all(|dep| {
            self.work_items
                .get(dep)
                .is_some_and(|found| found.status == WorkItemStatus::Done)
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    path: Option<PathBuf>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: Mutex::new(State::from_snapshot(snapshot)),
            path: None,
        }
    }

    /// Load `path` if it exists; `close` writes the state back to it.
    pub fn open(path: &Path) -> Result<Self> {
        let snapshot = if path.exists() {
            load_snapshot(path)?
        } else {
            Snapshot::default()
        };
        Ok(Self {
            state: Mutex::new(State::from_snapshot(snapshot)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().to_snapshot()
    }

    /// Goals are created outside the daemon; this is the entry point for
    /// seeding them.
    pub fn insert_goal(&self, goal: Goal) -> Result<()> {
        let mut state = self.lock();
        if state.goals.contains_key(&goal.id) {
            bail!("goal '{}' already exists", goal.id);
        }
        state.goals.insert(goal.id.clone(), goal);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Repository for MemoryRepository {
    fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        state.closed = false;
        debug!(goals = state.goals.len(), "repository initialized");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(path) = &self.path {
            write_snapshot(path, &state.to_snapshot())
                .with_context(|| format!("persist repository to {}", path.display()))?;
            info!(path = %path.display(), "repository persisted");
        }
        Ok(())
    }

    fn get_goal(&self, goal_id: &str) -> Result<Option<Goal>> {
        Ok(self.lock().goals.get(goal_id).cloned())
    }

    fn list_goals(&self, status: Option<GoalStatus>) -> Result<Vec<Goal>> {
        let state = self.lock();
        let mut goals: Vec<Goal> = state
            .goals
            .values()
            .filter(|goal| status.is_none_or(|s| goal.status == s))
            .cloned()
            .collect();
        goals.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(goals)
    }

    fn update_goal_status(&self, goal_id: &str, status: GoalStatus) -> Result<()> {
        let mut state = self.lock();
        let goal = state.goal_mut(goal_id)?;
        goal.status = status;
        goal.updated_at = Utc::now();
        Ok(())
    }

    fn update_goal_spending(&self, goal_id: &str, delta: &UsageDelta) -> Result<Goal> {
        if delta.time_minutes < 0.0 || delta.cost_usd < 0.0 {
            bail!("spend delta for goal '{goal_id}' must not be negative");
        }
        let mut state = self.lock();
        let goal = state.goal_mut(goal_id)?;
        goal.spent_tokens = goal.spent_tokens.saturating_add(delta.tokens);
        goal.spent_time_minutes += delta.time_minutes;
        goal.spent_cost_usd += delta.cost_usd;
        goal.updated_at = Utc::now();
        Ok(goal.clone())
    }

    fn create_work_items(&self, items: &[WorkItem]) -> Result<()> {
        let mut state = self.lock();
        for item in items {
            if !state.goals.contains_key(&item.goal_id) {
                bail!("work item '{}': goal '{}' not found", item.id, item.goal_id);
            }
            if state.work_items.contains_key(&item.id) {
                bail!("work item '{}' already exists", item.id);
            }
        }
        for item in items {
            state.work_items.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItem>> {
        Ok(self.lock().work_items.get(work_item_id).cloned())
    }

    fn list_work_items(&self, goal_id: &str) -> Result<Vec<WorkItem>> {
        Ok(self
            .lock()
            .work_items
            .values()
            .filter(|item| item.goal_id == goal_id)
            .cloned()
            .collect())
    }

    fn get_ready_work_items(&self, goal_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let state = self.lock();
        let mut ready: Vec<WorkItem> = state
            .work_items
            .values()
            .filter(|item| item.status == WorkItemStatus::Ready)
            .filter(|item| goal_id.is_none_or(|g| item.goal_id == g))
            .filter(|item| {
                state
                    .goals
                    .get(&item.goal_id)
                    .is_some_and(|goal| goal.status == GoalStatus::Active)
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(ready)
    }

    fn get_blocked_work_items(&self, completed_id: &str) -> Result<Vec<WorkItem>> {
        Ok(self
            .lock()
            .work_items
            .values()
            .filter(|item| {
                item.status == WorkItemStatus::Queued && item.dependencies.contains(completed_id)
            })
            .cloned()
            .collect())
    }

    fn update_work_item_status(&self, work_item_id: &str, status: WorkItemStatus) -> Result<()> {
        let mut state = self.lock();
        let item = state.item_mut(work_item_id)?;
        if item.status.is_terminal() && item.status != status {
            bail!(
                "work item '{}' is {:?} and cannot move to {:?}",
                work_item_id,
                item.status,
                status
            );
        }
        item.status = status;
        item.updated_at = Utc::now();
        Ok(())
    }

    fn update_work_item_status_if_dependencies_met(
        &self,
        work_item_id: &str,
        status: WorkItemStatus,
    ) -> Result<bool> {
        let mut state = self.lock();
        let item = state
            .work_items
            .get(work_item_id)
            .ok_or_else(|| anyhow!("work item '{work_item_id}' not found"))?;
        if item.status.is_terminal() || !state.dependencies_done(item) {
            return Ok(false);
        }
        let item = state.item_mut(work_item_id)?;
        item.status = status;
        item.updated_at = Utc::now();
        Ok(true)
    }

    fn update_work_item_verification(
        &self,
        work_item_id: &str,
        status: VerificationStatus,
    ) -> Result<()> {
        let mut state = self.lock();
        let item = state.item_mut(work_item_id)?;
        item.verification_status = status;
        Ok(())
    }

    fn increment_work_item_retry(&self, work_item_id: &str) -> Result<u32> {
        let mut state = self.lock();
        let item = state.item_mut(work_item_id)?;
        item.retry_count += 1;
        Ok(item.retry_count)
    }

    fn create_run(&self, run: NewRun) -> Result<Run> {
        let mut state = self.lock();
        if !state.work_items.contains_key(&run.work_item_id) {
            bail!("work item '{}' not found", run.work_item_id);
        }
        let created = Run {
            id: Uuid::new_v4().to_string(),
            work_item_id: run.work_item_id,
            goal_id: run.goal_id,
            agent_type: run.agent_type,
            model: run.model,
            run_sequence: run.run_sequence,
            status: RunStatus::Running,
            tokens_used: 0,
            cost_usd: 0.0,
            time_seconds: 0.0,
            artifacts: Vec::new(),
            error_message: None,
            execution_log: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        state.runs.push(created.clone());
        Ok(created)
    }

    fn complete_run(&self, run_id: &str, completion: RunCompletion) -> Result<Run> {
        let mut state = self.lock();
        let run = state
            .runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or_else(|| anyhow!("run '{run_id}' not found"))?;
        if run.status != RunStatus::Running {
            bail!("run '{run_id}' already completed");
        }
        run.status = if completion.success {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        run.tokens_used = completion.tokens_used;
        run.cost_usd = completion.cost_usd;
        run.time_seconds = completion.time_seconds;
        run.artifacts = completion.artifacts;
        run.error_message = completion.error_message;
        run.execution_log = completion.execution_log;
        run.completed_at = Some(Utc::now());
        Ok(run.clone())
    }

    fn get_runs_by_work_item(&self, work_item_id: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .lock()
            .runs
            .iter()
            .filter(|run| run.work_item_id == work_item_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.run_sequence);
        Ok(runs)
    }

    fn create_escalation(&self, escalation: NewEscalation) -> Result<Escalation> {
        let created = Escalation {
            id: Uuid::new_v4().to_string(),
            work_item_id: escalation.work_item_id,
            goal_id: escalation.goal_id,
            run_id: escalation.run_id,
            escalation_type: escalation.escalation_type,
            severity: escalation.severity,
            title: escalation.title,
            description: escalation.description,
            status: EscalationStatus::Open,
            resolution_action: None,
            resolver: None,
            created_at: Utc::now(),
        };
        self.lock().escalations.push(created.clone());
        Ok(created)
    }

    fn list_escalations(&self, goal_id: Option<&str>) -> Result<Vec<Escalation>> {
        Ok(self
            .lock()
            .escalations
            .iter()
            .filter(|esc| goal_id.is_none_or(|g| esc.goal_id == g))
            .cloned()
            .collect())
    }

    fn get_repeated_error_signatures(
        &self,
        work_item_id: &str,
        threshold: u32,
    ) -> Result<Vec<String>> {
        let state = self.lock();
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for run in &state.runs {
            if run.work_item_id != work_item_id || run.status != RunStatus::Failure {
                continue;
            }
            if let Some(message) = run.error_message.as_deref() {
                *counts.entry(error_signature(message)).or_insert(0) += 1;
            }
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .map(|(signature, _)| signature)
            .collect())
    }
}
