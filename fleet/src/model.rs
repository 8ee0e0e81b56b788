//! Entity shapes for goals, work items, runs and escalations.
//!
//! These records are plain data. Lifecycle rules live in [`crate::core`] and
//! are applied by the [`crate::daemon::Daemon`]; persistence lives behind
//! [`crate::io::repository::Repository`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Queued,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub verification_method: String,
    pub required: bool,
}

/// Top-level unit of intent. Spend fields only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub success_criteria: Vec<SuccessCriterion>,
    pub status: GoalStatus,
    pub priority: u8,
    pub budget_tokens: Option<u64>,
    pub budget_time_minutes: Option<f64>,
    pub budget_cost_usd: Option<f64>,
    #[serde(default)]
    pub spent_tokens: u64,
    #[serde(default)]
    pub spent_time_minutes: f64,
    #[serde(default)]
    pub spent_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Queued,
    Ready,
    InProgress,
    Blocked,
    Done,
    Failed,
}

impl WorkItemStatus {
    /// `done` and `failed` are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemStatus::Done | WorkItemStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Code,
    Doc,
    Test,
    Analysis,
    Research,
    Design,
    Refactor,
}

impl ItemType {
    pub fn label(self) -> &'static str {
        match self {
            ItemType::Code => "code",
            ItemType::Doc => "doc",
            ItemType::Test => "test",
            ItemType::Analysis => "analysis",
            ItemType::Research => "research",
            ItemType::Design => "design",
            ItemType::Refactor => "refactor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Effort {
    S,
    M,
    L,
    XL,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

/// Schedulable unit of work belonging to exactly one goal.
///
/// `updated_at` is refreshed on every status change, so it doubles as the
/// time-in-state anchor for stuck detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub goal_id: String,
    pub title: String,
    pub description: String,
    pub item_type: ItemType,
    pub status: WorkItemStatus,
    pub priority: u8,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub blocks: BTreeSet<String>,
    pub estimated_effort: Effort,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

/// One execution attempt of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub work_item_id: String,
    pub goal_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub model: Option<String>,
    pub run_sequence: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub time_seconds: f64,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub execution_log: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields the daemon supplies when opening a run; the repository assigns
/// the id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub work_item_id: String,
    pub goal_id: String,
    pub agent_type: String,
    pub model: Option<String>,
    pub run_sequence: u32,
}

/// Terminal outcome written by `complete_run`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunCompletion {
    pub success: bool,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub time_seconds: f64,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
    pub execution_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    Stuck,
    ValidationFailed,
    CircularDependency,
    MissingDependency,
    BudgetExceeded,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    Resolved,
    Dismissed,
}

/// Request for human intervention. References are lookups, not ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub work_item_id: String,
    pub goal_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub escalation_type: EscalationType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub status: EscalationStatus,
    #[serde(default)]
    pub resolution_action: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEscalation {
    pub work_item_id: String,
    pub goal_id: String,
    pub run_id: Option<String>,
    pub escalation_type: EscalationType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
}

/// Additive spend applied to a goal after a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageDelta {
    pub tokens: u64,
    pub time_minutes: f64,
    pub cost_usd: f64,
}

/// A single invariant violation, reported rather than thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
