//! Persistence contract required by the daemon.
//!
//! Implementations must make each status transition an atomic
//! read-modify-write. Every method is synchronous; the daemon never holds a
//! repository borrow across an await point.

use anyhow::Result;

use crate::model::{
    Escalation, Goal, GoalStatus, NewEscalation, NewRun, Run, RunCompletion, UsageDelta,
    VerificationStatus, WorkItem, WorkItemStatus,
};

pub trait Repository: Send + Sync {
    fn initialize(&self) -> Result<()>;

    /// Flush and release resources. Idempotent.
    fn close(&self) -> Result<()>;

    fn get_goal(&self, goal_id: &str) -> Result<Option<Goal>>;

    /// Goals ordered by priority descending, then id.
    fn list_goals(&self, status: Option<GoalStatus>) -> Result<Vec<Goal>>;

    fn update_goal_status(&self, goal_id: &str, status: GoalStatus) -> Result<()>;

    /// Add `delta` to the goal's spend and return the updated goal.
    fn update_goal_spending(&self, goal_id: &str, delta: &UsageDelta) -> Result<Goal>;

    /// Insert all items or none.
    fn create_work_items(&self, items: &[WorkItem]) -> Result<()>;

    fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItem>>;

    fn list_work_items(&self, goal_id: &str) -> Result<Vec<WorkItem>>;

    /// `ready` items of `active` goals, optionally scoped to one goal.
    fn get_ready_work_items(&self, goal_id: Option<&str>) -> Result<Vec<WorkItem>>;

    /// `queued` items that list `completed_id` as a dependency.
    fn get_blocked_work_items(&self, completed_id: &str) -> Result<Vec<WorkItem>>;

    fn update_work_item_status(&self, work_item_id: &str, status: WorkItemStatus) -> Result<()>;

    /// Set `status` only when every dependency is `done`. Returns whether the
    /// transition happened.
    fn update_work_item_status_if_dependencies_met(
        &self,
        work_item_id: &str,
        status: WorkItemStatus,
    ) -> Result<bool>;

    fn update_work_item_verification(
        &self,
        work_item_id: &str,
        status: VerificationStatus,
    ) -> Result<()>;

    /// Increment `retry_count` by exactly one and return the new value.
    fn increment_work_item_retry(&self, work_item_id: &str) -> Result<u32>;

    fn create_run(&self, run: NewRun) -> Result<Run>;

    fn complete_run(&self, run_id: &str, completion: RunCompletion) -> Result<Run>;

    /// Runs ordered by `run_sequence`.
    fn get_runs_by_work_item(&self, work_item_id: &str) -> Result<Vec<Run>>;

    fn create_escalation(&self, escalation: NewEscalation) -> Result<Escalation>;

    fn list_escalations(&self, goal_id: Option<&str>) -> Result<Vec<Escalation>>;

    /// Normalized error signatures seen at least `threshold` times across the
    /// item's failed runs.
    fn get_repeated_error_signatures(&self, work_item_id: &str, threshold: u32)
    -> Result<Vec<String>>;
}
