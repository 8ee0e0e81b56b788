//! Test-only builders for fleet records and scripted collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::core::decision::Decision;
use crate::core::graph::derive_blocks;
use crate::core::model_selector::Availability;
use crate::daemon::{Collaborators, Daemon};
use crate::events::DaemonEvent;
use crate::io::collaborators::{
    EvaluationRequest, EvaluationResult, Evaluator, ExecutionReport, ExecutionRequest, GateResult,
    Plan, PlanRequest, PlannedWorkItem, Planner, RuleBasedEvaluator, VerificationResult, Verifier,
    WorkExecutor,
};
use crate::io::config::FleetConfig;
use crate::io::memory_store::MemoryRepository;
use crate::io::repository::Repository;
use crate::model::{
    Effort, Goal, GoalStatus, ItemType, Run, RunStatus, SuccessCriterion, VerificationStatus,
    WorkItem, WorkItemStatus,
};

/// Tokens reported by a default successful scripted run.
pub const DEFAULT_TOKENS: u64 = 1_200;

/// 2025-01-01T00:00:00Z.
pub fn fixed_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

pub fn goal(id: &str) -> Goal {
    Goal {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        success_criteria: vec![SuccessCriterion {
            description: "tests pass".to_string(),
            kind: "test".to_string(),
            verification_method: "cargo test".to_string(),
            required: true,
        }],
        status: GoalStatus::Queued,
        priority: 50,
        budget_tokens: None,
        budget_time_minutes: None,
        budget_cost_usd: None,
        spent_tokens: 0,
        spent_time_minutes: 0.0,
        spent_cost_usd: 0.0,
        created_at: fixed_time(),
        updated_at: fixed_time(),
    }
}

pub fn work_item(id: &str, goal_id: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        goal_id: goal_id.to_string(),
        title: format!("{id} title"),
        description: format!("Implement {id}."),
        item_type: ItemType::Code,
        status: WorkItemStatus::Queued,
        priority: 50,
        dependencies: Default::default(),
        blocks: Default::default(),
        estimated_effort: Effort::M,
        retry_count: 0,
        max_retries: 3,
        verification_status: VerificationStatus::Pending,
        assigned_agent: None,
        created_at: fixed_time(),
        updated_at: fixed_time(),
    }
}

pub fn item_with_deps(id: &str, goal_id: &str, deps: &[&str]) -> WorkItem {
    let mut item = work_item(id, goal_id);
    item.dependencies = deps.iter().map(|dep| dep.to_string()).collect();
    item
}

pub fn item_with_status(id: &str, goal_id: &str, status: WorkItemStatus) -> WorkItem {
    let mut item = work_item(id, goal_id);
    item.status = status;
    item
}

pub fn run_record(id: &str, item: &WorkItem, status: RunStatus) -> Run {
    Run {
        id: id.to_string(),
        work_item_id: item.id.clone(),
        goal_id: item.goal_id.clone(),
        agent_type: "worker".to_string(),
        model: Some("sonnet".to_string()),
        run_sequence: 1,
        status,
        tokens_used: 0,
        cost_usd: 0.0,
        time_seconds: 0.0,
        artifacts: Vec::new(),
        error_message: None,
        execution_log: None,
        started_at: fixed_time(),
        completed_at: None,
    }
}

pub fn planned(key: &str) -> PlannedWorkItem {
    PlannedWorkItem {
        key: key.to_string(),
        title: format!("{key} title"),
        description: format!("Implement {key}."),
        item_type: ItemType::Code,
        priority: 50,
        estimated_effort: Effort::M,
        max_retries: None,
    }
}

pub fn success_report(work_item_id: &str) -> ExecutionReport {
    ExecutionReport {
        success: true,
        tokens_used: DEFAULT_TOKENS,
        cost_usd: 0.012,
        time_seconds: 30.0,
        artifacts: vec![format!("out/{work_item_id}.patch")],
        error_message: None,
        execution_log: None,
    }
}

pub fn failure_report(message: &str) -> ExecutionReport {
    ExecutionReport {
        success: false,
        tokens_used: 300,
        cost_usd: 0.003,
        time_seconds: 6.0,
        artifacts: Vec::new(),
        error_message: Some(message.to_string()),
        execution_log: None,
    }
}

// -------------------------------------------------------------------------
// scripted collaborators

#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    plans: Mutex<HashMap<String, Plan>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    pub fn set_plan(&self, goal_id: &str, plan: Plan) {
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(goal_id.to_string(), plan);
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan_work_items(&self, request: PlanRequest) -> Result<Plan> {
        let goal_id = request.goal.id.clone();
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&goal_id)
            .cloned()
            .ok_or_else(|| anyhow!("no plan scripted for goal '{goal_id}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCall {
    pub work_item_id: String,
    pub model: String,
    pub run_sequence: u32,
}

/// Plays back per-item reports; unscripted runs succeed.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    reports: Mutex<HashMap<String, VecDeque<ExecutionReport>>>,
    panics: Mutex<HashSet<String>>,
    hangs: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<ExecutedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedExecutor {
    pub fn push_report(&self, work_item_id: &str, report: ExecutionReport) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(work_item_id.to_string())
            .or_default()
            .push_back(report);
    }

    /// Queue `times` failures carrying the same message.
    pub fn fail_with(&self, work_item_id: &str, message: &str, times: usize) {
        for _ in 0..times {
            self.push_report(work_item_id, failure_report(message));
        }
    }

    pub fn panic_on(&self, work_item_id: &str) {
        self.panics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(work_item_id.to_string());
    }

    /// Runs for this item only end when cancelled.
    pub fn hang_on(&self, work_item_id: &str) {
        self.hangs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(work_item_id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> Vec<ExecutedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        let id = request.work_item.id.clone();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ExecutedCall {
                work_item_id: id.clone(),
                model: request.model.clone(),
                run_sequence: request.run.run_sequence,
            });
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if self.panics.lock().unwrap_or_else(|e| e.into_inner()).contains(&id) {
            panic!("scripted executor panic for {id}");
        }
        if self.hangs.lock().unwrap_or_else(|e| e.into_inner()).contains(&id) {
            request.cancel.cancelled().await;
            return Ok(failure_report("cancelled"));
        }
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::select! {
                _ = request.cancel.cancelled() => return Ok(failure_report("cancelled")),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let scripted = self
            .reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or_else(|| success_report(&id)))
    }
}

/// Passes every run except those of items marked with [`ScriptedVerifier::fail`].
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    failing: Mutex<HashSet<String>>,
}

impl ScriptedVerifier {
    pub fn fail(&self, work_item_id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(work_item_id.to_string());
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, work_item: &WorkItem, _run: &Run) -> Result<VerificationResult> {
        let passed = !self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&work_item.id);
        Ok(VerificationResult {
            passed,
            gate_results: vec![GateResult {
                name: "tests".to_string(),
                passed,
                details: None,
            }],
        })
    }
}

/// Returns queued decisions per item, falling back to the rule-based one.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    decisions: Mutex<HashMap<String, VecDeque<Decision>>>,
}

impl ScriptedEvaluator {
    pub fn push_decision(&self, work_item_id: &str, decision: Decision) {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(work_item_id.to_string())
            .or_default()
            .push_back(decision);
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationResult> {
        let scripted = self
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&request.work_item.id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(decision) => Ok(EvaluationResult {
                decision,
                reasoning: format!("scripted {decision}"),
                next_actions: Vec::new(),
            }),
            None => RuleBasedEvaluator.evaluate(request).await,
        }
    }
}

// -------------------------------------------------------------------------
// harness

/// A daemon wired to an in-memory repository and scripted collaborators.
pub struct TestFleet {
    pub daemon: Arc<Daemon>,
    pub repo: Arc<MemoryRepository>,
    pub planner: Arc<ScriptedPlanner>,
    pub executor: Arc<ScriptedExecutor>,
    pub verifier: Arc<ScriptedVerifier>,
    pub evaluator: Arc<ScriptedEvaluator>,
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFleet {
    pub fn new() -> Self {
        Self::build(FleetConfig::default(), None)
    }

    pub fn with_config(config: FleetConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_availability(is_model_available: Availability) -> Self {
        Self::build(FleetConfig::default(), Some(is_model_available))
    }

    fn build(config: FleetConfig, availability: Option<Availability>) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let planner = Arc::new(ScriptedPlanner::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let verifier = Arc::new(ScriptedVerifier::default());
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let collaborators = Collaborators {
            planner: planner.clone(),
            executor: executor.clone(),
            verifier: verifier.clone(),
            evaluator: evaluator.clone(),
        };
        let mut daemon = Daemon::new(config, repo.clone(), collaborators).expect("valid config");
        if let Some(availability) = availability {
            daemon = daemon.with_model_availability(availability);
        }
        Self {
            daemon: Arc::new(daemon),
            repo,
            planner,
            executor,
            verifier,
            evaluator,
        }
    }

    pub fn add_goal(&self, goal: Goal) {
        self.repo.insert_goal(goal).expect("insert goal");
    }

    /// Seed an already planned goal.
    pub fn add_active_goal_with_items(&self, goal_id: &str, mut items: Vec<WorkItem>) {
        let mut seeded = goal(goal_id);
        seeded.status = GoalStatus::Active;
        self.add_goal(seeded);
        derive_blocks(&mut items);
        self.repo.create_work_items(&items).expect("create items");
    }

    pub fn item(&self, work_item_id: &str) -> WorkItem {
        self.repo
            .get_work_item(work_item_id)
            .expect("get work item")
            .unwrap_or_else(|| panic!("work item {work_item_id} missing"))
    }

    pub fn goal(&self, goal_id: &str) -> Goal {
        self.repo
            .get_goal(goal_id)
            .expect("get goal")
            .unwrap_or_else(|| panic!("goal {goal_id} missing"))
    }

    pub fn runs(&self, work_item_id: &str) -> Vec<Run> {
        self.repo
            .get_runs_by_work_item(work_item_id)
            .expect("get runs")
    }

    /// Everything buffered on `events` right now.
    pub fn drain(events: &mut broadcast::Receiver<DaemonEvent>) -> Vec<DaemonEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }
}
