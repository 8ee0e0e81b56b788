//! External collaborators the daemon drives: planning, execution,
//! verification and evaluation.
//!
//! Each is a narrow async trait. Errors returned here are caught by the
//! daemon at the item or goal boundary and turned into a state transition;
//! they never stop the loop.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::decision::{Decision, ExhaustionSignals, recommend_decision};
use crate::model::{Effort, Goal, ItemType, Run, RunStatus, WorkItem};

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub goal: Goal,
    /// Model chosen for planning from the goal's complexity.
    pub model: String,
}

/// A work item as proposed by the planner. `key` is local to the plan; the
/// daemon derives the persisted id from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedWorkItem {
    pub key: String,
    pub title: String,
    pub description: String,
    pub item_type: ItemType,
    pub priority: u8,
    pub estimated_effort: Effort,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// `from` depends on `on`; both are plan keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDependency {
    pub from: String,
    pub on: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub work_items: Vec<PlannedWorkItem>,
    #[serde(default)]
    pub dependencies: Vec<PlannedDependency>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan_work_items(&self, request: PlanRequest) -> Result<Plan>;
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub work_item: WorkItem,
    pub run: Run,
    pub model: String,
    /// Triggered when the daemon aborts the run. Executors should stop
    /// promptly; the daemon does not wait for them once it fires.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub time_seconds: f64,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
    pub execution_log: Option<String>,
}

#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    #[serde(default)]
    pub gate_results: Vec<GateResult>,
}

impl VerificationResult {
    /// Stand-in for a failed run, which is never sent to the verifier.
    pub fn skipped_after_failure(reason: Option<&str>) -> Self {
        Self {
            passed: false,
            gate_results: vec![GateResult {
                name: "execution".to_string(),
                passed: false,
                details: reason.map(str::to_string),
            }],
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, work_item: &WorkItem, run: &Run) -> Result<VerificationResult>;
}

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub work_item: WorkItem,
    pub run: Run,
    pub verification: VerificationResult,
    pub signals: ExhaustionSignals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub decision: Decision,
    pub reasoning: String,
    #[serde(default)]
    pub next_actions: Vec<String>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationResult>;
}

/// Decides from run status, verification and exhaustion alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedEvaluator;

#[async_trait]
impl Evaluator for RuleBasedEvaluator {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationResult> {
        let succeeded = request.run.status == RunStatus::Success;
        let decision = recommend_decision(
            succeeded,
            request.verification.passed,
            &request.signals,
        );
        let reasoning = match decision {
            Decision::Publish => "run succeeded and verification passed".to_string(),
            Decision::Escalate => "retries exhausted or the same error keeps repeating".to_string(),
            _ => match request.run.error_message.as_deref() {
                Some(err) => format!("run failed: {err}"),
                None => "verification failed".to_string(),
            },
        };
        Ok(EvaluationResult {
            decision,
            reasoning,
            next_actions: Vec::new(),
        })
    }
}
