//! Orchestration daemon: plans queued goals, promotes ready work, dispatches
//! bounded concurrent runs and applies evaluation decisions.
//!
//! One cycle is `plan -> promote -> dispatch -> (stuck sweep)`. Dispatched
//! items run as futures joined on the daemon task; nothing is spawned. Each
//! active run owns a registry slot holding its cancellation token, and the
//! slot is released by a drop guard however the item finishes.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::{BudgetTracker, UsageRecord, UsageSink, WarningLevel};
use crate::core::complexity::ComplexityScorer;
use crate::core::decision::{Decision, ExhaustionSignals, resolve_decision};
use crate::core::graph::derive_blocks;
use crate::core::invariants::validate_all;
use crate::core::model_selector::{Availability, ModelSelector};
use crate::core::stuck::{StuckAction, StuckDetection, StuckDetector};
use crate::events::{DaemonEvent, EventBus};
use crate::io::collaborators::{
    EvaluationRequest, Evaluator, ExecutionReport, ExecutionRequest, Plan, PlanRequest, Planner,
    VerificationResult, Verifier, WorkExecutor,
};
use crate::io::config::FleetConfig;
use crate::io::repository::Repository;
use crate::model::{
    EscalationType, Goal, GoalStatus, NewEscalation, NewRun, Run, RunCompletion, RunStatus,
    Severity, UsageDelta, VerificationStatus, WorkItem, WorkItemStatus,
};

/// The external services the daemon drives.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn WorkExecutor>,
    pub verifier: Arc<dyn Verifier>,
    pub evaluator: Arc<dyn Evaluator>,
}

/// Why an active run was cancelled. Decides where the item lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Daemon stop: the item goes back to `ready`.
    Shutdown,
    /// Goal cancelled: the item goes back to `ready`.
    GoalCancelled,
    /// Stuck escalation: the item is `blocked`.
    Escalated,
    /// Run timeout: one retry is spent and the item goes back to `ready`.
    TimedOut,
}

/// Registry entry for one in-flight work item.
#[derive(Debug)]
struct RunHandle {
    goal_id: String,
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

impl RunHandle {
    fn new(goal_id: &str) -> Self {
        Self {
            goal_id: goal_id.to_string(),
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// The first reason wins.
    fn cancel(&self, reason: CancelReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert(reason);
        self.token.cancel();
    }

    fn reason(&self) -> CancelReason {
        let slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        slot.unwrap_or(CancelReason::Shutdown)
    }
}

type Registry = HashMap<String, Arc<RunHandle>>;

/// Releases a registry slot when the item's future finishes or is dropped.
struct SlotGuard<'a> {
    registry: &'a Mutex<Registry>,
    work_item_id: String,
    handle: Arc<RunHandle>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if registry
            .get(&self.work_item_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.handle))
        {
            registry.remove(&self.work_item_id);
        }
    }
}

pub struct Daemon {
    config: FleetConfig,
    repository: Arc<dyn Repository>,
    collaborators: Collaborators,
    budget: BudgetTracker,
    selector: ModelSelector,
    stuck: StuckDetector,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
    running: AtomicBool,
    cycle: AtomicU64,
    last_sweep: Mutex<Instant>,
    events: EventBus,
}

impl Daemon {
    pub fn new(
        config: FleetConfig,
        repository: Arc<dyn Repository>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate().context("invalid fleet config")?;
        Ok(Self {
            budget: BudgetTracker::new(config.budget.clone()),
            selector: ModelSelector::new(
                ComplexityScorer::new(config.complexity.clone()),
                config.models.clone(),
            ),
            stuck: StuckDetector::new(config.stuck.clone()),
            events: EventBus::new(config.daemon.event_buffer),
            registry: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
            config,
            repository,
            collaborators,
        })
    }

    /// Replace the model availability predicate (all models by default).
    pub fn with_model_availability(mut self, is_model_available: Availability) -> Self {
        self.selector = ModelSelector::with_availability(
            ComplexityScorer::new(self.config.complexity.clone()),
            self.config.models.clone(),
            is_model_available,
        );
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    pub fn active_run_count(&self) -> usize {
        self.lock_registry().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Initialize the repository and run cycles until [`Daemon::stop`].
    ///
    /// Returns immediately when already running or already stopped. A
    /// failing cycle is logged and the loop continues.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            warn!("daemon already stopped; start ignored");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("daemon already running");
            return Ok(());
        }
        if let Err(err) = self.repository.initialize() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err.context("initialize repository"));
        }
        info!(
            max_concurrent_runs = self.config.daemon.max_concurrent_runs,
            polling_interval_ms = self.config.daemon.polling_interval_ms,
            "daemon started"
        );

        let poll = Duration::from_millis(self.config.daemon.polling_interval_ms);
        while !self.shutdown.is_cancelled() {
            if let Err(err) = self.run_cycle().await {
                error!(error = %format!("{err:#}"), "cycle failed");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.close_repository();
        self.events.emit(DaemonEvent::Stopped);
        info!("daemon stopped");
        Ok(())
    }

    /// Abort every active run, clear the registry and stop the loop.
    ///
    /// Synchronous and idempotent. When the loop is running it closes the
    /// repository after in-flight items have recorded their cancellation;
    /// otherwise the repository is closed here.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let handles: Vec<Arc<RunHandle>> = self.lock_registry().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel(CancelReason::Shutdown);
        }
        self.shutdown.cancel();
        info!(aborted = handles.len(), "stop requested");
        if !self.running.load(Ordering::SeqCst) {
            self.close_repository();
            self.events.emit(DaemonEvent::Stopped);
        }
    }

    /// Cancel a goal. Its active runs are aborted and their items return to
    /// `ready`; items of a non-active goal are never dispatched.
    pub fn cancel_goal(&self, goal_id: &str) -> Result<()> {
        self.repository
            .update_goal_status(goal_id, GoalStatus::Cancelled)
            .with_context(|| format!("cancel goal {goal_id}"))?;
        let aborted = self.cancel_where(|handle| handle.goal_id == goal_id, CancelReason::GoalCancelled);
        self.budget.unregister_usage_sink(goal_id);
        info!(goal_id, aborted, "goal cancelled");
        Ok(())
    }

    /// One full cycle: plan, promote, dispatch.
    pub async fn run_cycle(&self) -> Result<()> {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.emit(DaemonEvent::CycleStarted { cycle });
        debug!(cycle, "cycle started");

        self.plan_queued_goals().await.context("planning")?;
        let promoted = self.promote_ready_items().context("promotion")?;
        let dispatched = self.dispatch().await.context("dispatch")?;
        self.maybe_run_stuck_sweep();

        debug!(cycle, promoted, dispatched, "cycle finished");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // planning

    async fn plan_queued_goals(&self) -> Result<()> {
        for goal in self.repository.list_goals(Some(GoalStatus::Queued))? {
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                outcome = self.plan_goal(&goal) => outcome,
            };
            if let Err(err) = outcome {
                let reason = format!("{err:#}");
                warn!(goal_id = %goal.id, %reason, "planning failed; goal stays queued");
                self.events.emit(DaemonEvent::PlanningFailed {
                    goal_id: goal.id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(goal_id = %goal.id))]
    async fn plan_goal(&self, goal: &Goal) -> Result<()> {
        let selection = self.selector.select_model_for_planning(goal)?;
        debug!(model = %selection.model, tier = %selection.tier, "planning goal");
        let plan = self
            .collaborators
            .planner
            .plan_work_items(PlanRequest {
                goal: goal.clone(),
                model: selection.model,
            })
            .await
            .context("planner")?;
        if plan.work_items.is_empty() {
            bail!("plan has no work items");
        }

        let items = materialize_plan(goal, &plan, self.config.daemon.default_max_retries, Utc::now());
        let violations = validate_all(std::slice::from_ref(goal), &items);
        if !violations.is_empty() {
            let rendered: Vec<String> = violations.iter().map(ToString::to_string).collect();
            bail!("invalid plan: {}", rendered.join("; "));
        }

        self.repository.create_work_items(&items)?;
        self.repository
            .update_goal_status(&goal.id, GoalStatus::Active)?;
        self.ensure_usage_sink(&goal.id);
        info!(work_items = items.len(), "goal activated");
        self.events.emit(DaemonEvent::GoalActivated {
            goal_id: goal.id.clone(),
            work_items: items.len(),
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // promotion

    /// Queued items of active goals whose dependencies are done become
    /// `ready`. Runs every cycle, even without free slots.
    fn promote_ready_items(&self) -> Result<usize> {
        let mut promoted = 0;
        for goal in self.repository.list_goals(Some(GoalStatus::Active))? {
            for item in self.repository.list_work_items(&goal.id)? {
                if item.status == WorkItemStatus::Queued
                    && self
                        .repository
                        .update_work_item_status_if_dependencies_met(&item.id, WorkItemStatus::Ready)?
                {
                    debug!(work_item_id = %item.id, "promoted to ready");
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    // ---------------------------------------------------------------------
    // dispatch

    async fn dispatch(&self) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }
        let ready = self
            .repository
            .get_ready_work_items(self.config.daemon.goal_scope.as_deref())?;
        let reserved = self.reserve_slots(ready);
        if reserved.is_empty() {
            return Ok(0);
        }
        let count = reserved.len();
        debug!(count, "dispatching work items");

        let runs = join_all(
            reserved
                .into_iter()
                .map(|(item, handle)| self.run_item(item, handle)),
        );
        tokio::pin!(runs);

        let period = Duration::from_millis(self.config.stuck.check_interval_ms);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut runs => break,
                _ = ticker.tick() => self.maybe_run_stuck_sweep(),
            }
        }
        Ok(count)
    }

    /// Reserve up to the free slot count under one lock, highest priority
    /// first, ties by id.
    fn reserve_slots(&self, mut ready: Vec<WorkItem>) -> Vec<(WorkItem, Arc<RunHandle>)> {
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        let mut registry = self.lock_registry();
        let available = self
            .config
            .daemon
            .max_concurrent_runs
            .saturating_sub(registry.len());
        let mut reserved = Vec::new();
        for item in ready {
            if reserved.len() >= available {
                break;
            }
            if registry.contains_key(&item.id) {
                continue;
            }
            let handle = Arc::new(RunHandle::new(&item.goal_id));
            registry.insert(item.id.clone(), Arc::clone(&handle));
            reserved.push((item, handle));
        }
        reserved
    }

    /// Item boundary: errors and panics fail this item only.
    #[instrument(skip_all, fields(work_item_id = %item.id, goal_id = %item.goal_id))]
    async fn run_item(&self, item: WorkItem, handle: Arc<RunHandle>) {
        let _slot = SlotGuard {
            registry: &self.registry,
            work_item_id: item.id.clone(),
            handle: Arc::clone(&handle),
        };
        let outcome = AssertUnwindSafe(self.execute_item(&item, &handle))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(_) => "work item execution panicked".to_string(),
        };
        error!(%reason, "work item failed");
        self.fail_item(&item, &reason);
    }

    async fn execute_item(&self, item: &WorkItem, handle: &RunHandle) -> Result<()> {
        let goal = self
            .repository
            .get_goal(&item.goal_id)?
            .ok_or_else(|| anyhow!("goal '{}' not found", item.goal_id))?;

        if self.config.daemon.enforce_budget {
            let estimate = self.budget.estimate_usage(item);
            if self
                .budget
                .will_exceed_budget(&goal, estimate.tokens, estimate.cost_usd)
            {
                return self.block_for_budget(item, estimate.tokens);
            }
        }

        let selection = match self.selector.select_model(item) {
            Ok(selection) => selection,
            Err(err) => {
                warn!(error = %err, "no model available; item deferred");
                return Ok(());
            }
        };

        self.repository
            .update_work_item_status(&item.id, WorkItemStatus::InProgress)?;
        let previous_runs = self.repository.get_runs_by_work_item(&item.id)?;
        let run = self.repository.create_run(NewRun {
            work_item_id: item.id.clone(),
            goal_id: item.goal_id.clone(),
            agent_type: self.config.daemon.agent_type.clone(),
            model: Some(selection.model.clone()),
            run_sequence: u32::try_from(previous_runs.len()).unwrap_or(u32::MAX).saturating_add(1),
        })?;
        info!(
            run_id = %run.id,
            model = %selection.model,
            tier = %selection.tier,
            score = selection.score,
            "run started"
        );
        self.events.emit(DaemonEvent::WorkItemStarted {
            goal_id: item.goal_id.clone(),
            work_item_id: item.id.clone(),
            run_id: run.id.clone(),
            model: selection.model.clone(),
        });

        let current = self.current_item(&item.id)?;
        let request = ExecutionRequest {
            work_item: current,
            run: run.clone(),
            model: selection.model,
            cancel: handle.token.clone(),
        };
        let executed = tokio::select! {
            biased;
            _ = handle.token.cancelled() => None,
            result = self.collaborators.executor.execute(request) => Some(result),
        };
        let Some(result) = executed else {
            return self.settle_cancelled(item, &run, handle.reason());
        };
        let report = result.unwrap_or_else(|err| ExecutionReport {
            success: false,
            error_message: Some(format!("executor error: {err:#}")),
            ..ExecutionReport::default()
        });

        let completed = self.repository.complete_run(
            &run.id,
            RunCompletion {
                success: report.success,
                tokens_used: report.tokens_used,
                cost_usd: report.cost_usd,
                time_seconds: report.time_seconds,
                artifacts: report.artifacts,
                error_message: report.error_message,
                execution_log: report.execution_log,
            },
        )?;
        self.record_usage(&completed)?;

        let current = self.current_item(&item.id)?;
        let verification = if completed.status == RunStatus::Success {
            self.collaborators
                .verifier
                .verify(&current, &completed)
                .await
                .context("verifier")?
        } else {
            VerificationResult::skipped_after_failure(completed.error_message.as_deref())
        };

        let repeated = self
            .repository
            .get_repeated_error_signatures(&item.id, self.config.stuck.max_same_error_retries)?;
        let signals = ExhaustionSignals::for_item(&current, repeated);
        let evaluation = self
            .collaborators
            .evaluator
            .evaluate(EvaluationRequest {
                work_item: current.clone(),
                run: completed.clone(),
                verification: verification.clone(),
                signals: signals.clone(),
            })
            .await
            .context("evaluator")?;
        let decision = resolve_decision(evaluation.decision, &signals);
        if decision != evaluation.decision {
            info!(
                recommended = %evaluation.decision,
                %decision,
                "exhaustion overrides evaluation"
            );
        }

        if handle.token.is_cancelled() {
            return self.settle_cancelled(item, &completed, handle.reason());
        }
        self.apply_decision(&current, &completed, &verification, decision, &evaluation.reasoning)
    }

    // ---------------------------------------------------------------------
    // decisions

    fn apply_decision(
        &self,
        item: &WorkItem,
        run: &Run,
        verification: &VerificationResult,
        decision: Decision,
        reasoning: &str,
    ) -> Result<()> {
        let repo = &self.repository;
        match decision {
            Decision::Publish => {
                repo.update_work_item_verification(&item.id, VerificationStatus::Passed)?;
                repo.update_work_item_status(&item.id, WorkItemStatus::Done)?;
                self.release_dependents(&item.id)?;
                self.complete_goal_if_done(&item.goal_id)?;
            }
            Decision::Retry => {
                repo.update_work_item_verification(&item.id, VerificationStatus::Failed)?;
                let retries = repo.increment_work_item_retry(&item.id)?;
                repo.update_work_item_status(&item.id, WorkItemStatus::Ready)?;
                debug!(retry_count = retries, "retry scheduled");
            }
            Decision::Escalate => {
                repo.update_work_item_verification(&item.id, VerificationStatus::Failed)?;
                let escalation_type = if run.status == RunStatus::Success && !verification.passed {
                    EscalationType::ValidationFailed
                } else {
                    EscalationType::Stuck
                };
                self.escalate(
                    item,
                    Some(run.id.clone()),
                    escalation_type,
                    Severity::High,
                    reasoning,
                )?;
                repo.update_work_item_status(&item.id, WorkItemStatus::Blocked)?;
            }
            Decision::Replan => {
                repo.update_work_item_status(&item.id, WorkItemStatus::Blocked)?;
                self.events.emit(DaemonEvent::ReplanRequested {
                    goal_id: item.goal_id.clone(),
                    work_item_id: item.id.clone(),
                });
            }
        }
        info!(%decision, run_id = %run.id, "decision applied");
        self.events.emit(DaemonEvent::WorkItemCompleted {
            goal_id: item.goal_id.clone(),
            work_item_id: item.id.clone(),
            run_id: run.id.clone(),
            decision,
        });
        Ok(())
    }

    fn release_dependents(&self, completed_id: &str) -> Result<()> {
        for dependent in self.repository.get_blocked_work_items(completed_id)? {
            if self
                .repository
                .update_work_item_status_if_dependencies_met(&dependent.id, WorkItemStatus::Ready)?
            {
                debug!(work_item_id = %dependent.id, "dependent released");
            }
        }
        Ok(())
    }

    fn complete_goal_if_done(&self, goal_id: &str) -> Result<()> {
        let items = self.repository.list_work_items(goal_id)?;
        if items.is_empty() || items.iter().any(|item| item.status != WorkItemStatus::Done) {
            return Ok(());
        }
        self.repository
            .update_goal_status(goal_id, GoalStatus::Completed)?;
        self.budget.unregister_usage_sink(goal_id);
        info!(goal_id, "goal completed");
        self.events.emit(DaemonEvent::GoalCompleted {
            goal_id: goal_id.to_string(),
        });
        Ok(())
    }

    fn escalate(
        &self,
        item: &WorkItem,
        run_id: Option<String>,
        escalation_type: EscalationType,
        severity: Severity,
        description: &str,
    ) -> Result<()> {
        let escalation = self.repository.create_escalation(NewEscalation {
            work_item_id: item.id.clone(),
            goal_id: item.goal_id.clone(),
            run_id,
            escalation_type,
            severity,
            title: format!("{}: {}", item.title, escalation_label(escalation_type)),
            description: description.to_string(),
        })?;
        warn!(
            work_item_id = %item.id,
            escalation_id = %escalation.id,
            ?escalation_type,
            ?severity,
            "escalation created"
        );
        self.events.emit(DaemonEvent::EscalationCreated {
            goal_id: item.goal_id.clone(),
            work_item_id: item.id.clone(),
            escalation_id: escalation.id,
            escalation_type,
            severity,
        });
        Ok(())
    }

    fn block_for_budget(&self, item: &WorkItem, estimated_tokens: u64) -> Result<()> {
        self.escalate(
            item,
            None,
            EscalationType::BudgetExceeded,
            Severity::Critical,
            &format!("estimated {estimated_tokens} tokens would exceed the goal budget"),
        )?;
        self.repository
            .update_work_item_status(&item.id, WorkItemStatus::Blocked)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // cancellation and failure

    fn settle_cancelled(&self, item: &WorkItem, run: &Run, reason: CancelReason) -> Result<()> {
        if run.status == RunStatus::Running {
            self.repository.complete_run(
                &run.id,
                RunCompletion {
                    success: false,
                    error_message: Some(cancel_message(reason).to_string()),
                    ..RunCompletion::default()
                },
            )?;
        }
        let status = match reason {
            CancelReason::Shutdown | CancelReason::GoalCancelled => WorkItemStatus::Ready,
            CancelReason::Escalated => WorkItemStatus::Blocked,
            CancelReason::TimedOut => {
                self.repository.increment_work_item_retry(&item.id)?;
                WorkItemStatus::Ready
            }
        };
        self.repository.update_work_item_status(&item.id, status)?;
        info!(?reason, ?status, run_id = %run.id, "run cancelled");
        Ok(())
    }

    fn fail_item(&self, item: &WorkItem, reason: &str) {
        if let Err(err) = self.mark_failed(item, reason) {
            error!(work_item_id = %item.id, error = %format!("{err:#}"), "could not mark item failed");
        }
        self.events.emit(DaemonEvent::WorkItemFailed {
            goal_id: item.goal_id.clone(),
            work_item_id: item.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn mark_failed(&self, item: &WorkItem, reason: &str) -> Result<()> {
        self.close_open_runs(&item.id, reason)?;
        self.repository
            .update_work_item_status(&item.id, WorkItemStatus::Failed)
    }

    /// Complete any still-running run of the item as a failure.
    fn close_open_runs(&self, work_item_id: &str, reason: &str) -> Result<()> {
        for run in self.repository.get_runs_by_work_item(work_item_id)? {
            if run.status == RunStatus::Running {
                self.repository.complete_run(
                    &run.id,
                    RunCompletion {
                        success: false,
                        error_message: Some(reason.to_string()),
                        ..RunCompletion::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    fn cancel_where(&self, matches: impl Fn(&RunHandle) -> bool, reason: CancelReason) -> usize {
        let registry = self.lock_registry();
        let mut cancelled = 0;
        for handle in registry.values() {
            if matches(handle) {
                handle.cancel(reason);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn cancel_item(&self, work_item_id: &str, reason: CancelReason) -> bool {
        let registry = self.lock_registry();
        match registry.get(work_item_id) {
            Some(handle) => {
                handle.cancel(reason);
                true
            }
            None => false,
        }
    }

    // ---------------------------------------------------------------------
    // budget

    fn ensure_usage_sink(&self, goal_id: &str) {
        if self.budget.has_usage_sink(goal_id) {
            return;
        }
        let repository = Arc::clone(&self.repository);
        let owner = goal_id.to_string();
        let sink: UsageSink = Arc::new(move |delta: &UsageDelta| {
            repository.update_goal_spending(&owner, delta).map(|_| ())
        });
        self.budget.register_usage_sink(goal_id, sink);
    }

    fn record_usage(&self, run: &Run) -> Result<()> {
        self.ensure_usage_sink(&run.goal_id);
        let record = UsageRecord {
            run_id: run.id.clone(),
            delta: UsageDelta {
                tokens: run.tokens_used,
                time_minutes: run.time_seconds / 60.0,
                cost_usd: run.cost_usd,
            },
        };
        self.budget.record_usage(&run.goal_id, &record)?;

        let goal = self
            .repository
            .get_goal(&run.goal_id)?
            .ok_or_else(|| anyhow!("goal '{}' not found", run.goal_id))?;
        let status = self.budget.budget_status(&goal);
        if status.overall >= WarningLevel::Warning {
            for violation in self.budget.check_budget(&goal) {
                warn!(goal_id = %goal.id, resource = %violation.resource, "{}", violation.message);
            }
            self.events.emit(DaemonEvent::BudgetWarning {
                goal_id: goal.id.clone(),
                level: status.overall,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // stuck detection

    /// At most one sweep per `check_interval_ms`, the first one interval
    /// after construction.
    fn maybe_run_stuck_sweep(&self) {
        let interval = Duration::from_millis(self.config.stuck.check_interval_ms);
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < interval {
                return;
            }
            *last = Instant::now();
        }
        if let Err(err) = self.run_stuck_sweep(Utc::now()) {
            warn!(error = %format!("{err:#}"), "stuck sweep failed");
        }
    }

    /// Scan every active goal and act on the first detection per item.
    pub fn run_stuck_sweep(&self, now: DateTime<Utc>) -> Result<Vec<StuckDetection>> {
        let mut all = Vec::new();
        for goal in self.repository.list_goals(Some(GoalStatus::Active))? {
            let items = self.repository.list_work_items(&goal.id)?;
            let mut runs = Vec::new();
            for item in &items {
                runs.extend(self.repository.get_runs_by_work_item(&item.id)?);
            }
            let detections = self.stuck.scan_goal(&goal.id, &items, &runs, now);
            let by_id: HashMap<&str, &WorkItem> =
                items.iter().map(|item| (item.id.as_str(), item)).collect();

            let mut handled = HashSet::new();
            for detection in &detections {
                warn!(
                    work_item_id = %detection.work_item_id,
                    reason = %detection.reason,
                    action = %detection.action,
                    "{}",
                    detection.message
                );
                self.events.emit(DaemonEvent::StuckDetected {
                    goal_id: detection.goal_id.clone(),
                    work_item_id: detection.work_item_id.clone(),
                    reason: detection.reason,
                    action: detection.action,
                });
                if !handled.insert(detection.work_item_id.as_str()) {
                    continue;
                }
                let Some(&item) = by_id.get(detection.work_item_id.as_str()) else {
                    continue;
                };
                // Advisory detections stay visible; only acted-on items cool down.
                if self.act_on_detection(item, detection)? {
                    self.stuck
                        .acknowledge_stuck(&detection.work_item_id, None, now);
                }
            }
            all.extend(detections);
        }
        Ok(all)
    }

    /// Returns whether the detection changed anything.
    fn act_on_detection(&self, item: &WorkItem, detection: &StuckDetection) -> Result<bool> {
        match detection.action {
            StuckAction::Escalate if self.config.stuck.auto_escalate => {
                self.escalate(
                    item,
                    detection.run_id.clone(),
                    detection.reason.escalation_type(),
                    detection.reason.severity(),
                    &detection.message,
                )?;
                if !self.cancel_item(&item.id, CancelReason::Escalated) && !item.status.is_terminal() {
                    self.repository
                        .update_work_item_status(&item.id, WorkItemStatus::Blocked)?;
                }
                Ok(true)
            }
            StuckAction::Retry => {
                if self.cancel_item(&item.id, CancelReason::TimedOut) {
                    return Ok(true);
                }
                if item.status != WorkItemStatus::InProgress {
                    return Ok(false);
                }
                // Orphaned: no future owns this item any more.
                self.close_open_runs(&item.id, cancel_message(CancelReason::TimedOut))?;
                self.repository
                    .update_work_item_status(&item.id, WorkItemStatus::Ready)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ---------------------------------------------------------------------

    fn current_item(&self, work_item_id: &str) -> Result<WorkItem> {
        self.repository
            .get_work_item(work_item_id)?
            .ok_or_else(|| anyhow!("work item '{work_item_id}' not found"))
    }

    fn close_repository(&self) {
        if let Err(err) = self.repository.close() {
            error!(error = %format!("{err:#}"), "closing repository failed");
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Turn a plan into queued work items with ids `<goal_id>/<key>`.
///
/// Unknown dependency keys are kept so validation reports them.
pub fn materialize_plan(
    goal: &Goal,
    plan: &Plan,
    default_max_retries: u32,
    now: DateTime<Utc>,
) -> Vec<WorkItem> {
    let item_id = |key: &str| format!("{}/{}", goal.id, key);
    let mut items: Vec<WorkItem> = plan
        .work_items
        .iter()
        .map(|planned| WorkItem {
            id: item_id(&planned.key),
            goal_id: goal.id.clone(),
            title: planned.title.clone(),
            description: planned.description.clone(),
            item_type: planned.item_type,
            status: WorkItemStatus::Queued,
            priority: planned.priority,
            dependencies: plan
                .dependencies
                .iter()
                .filter(|dep| dep.from == planned.key)
                .map(|dep| item_id(&dep.on))
                .collect(),
            blocks: Default::default(),
            estimated_effort: planned.estimated_effort,
            retry_count: 0,
            max_retries: planned.max_retries.unwrap_or(default_max_retries),
            verification_status: VerificationStatus::Pending,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
        })
        .collect();
    derive_blocks(&mut items);
    items
}

fn escalation_label(escalation_type: EscalationType) -> &'static str {
    match escalation_type {
        EscalationType::Stuck => "stuck",
        EscalationType::ValidationFailed => "validation failed",
        EscalationType::CircularDependency => "circular dependency",
        EscalationType::MissingDependency => "missing dependency",
        EscalationType::BudgetExceeded => "budget exceeded",
        EscalationType::Timeout => "timeout",
    }
}

fn cancel_message(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::Shutdown => "cancelled: daemon stopped",
        CancelReason::GoalCancelled => "cancelled: goal cancelled",
        CancelReason::Escalated => "cancelled: escalated as stuck",
        CancelReason::TimedOut => "cancelled: run timed out",
    }
}
