//! Typed daemon events broadcast to subscribers.
//!
//! Events are the product-facing stream of what the daemon did; `tracing`
//! output is diagnostics only.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::budget::WarningLevel;
use crate::core::decision::Decision;
use crate::core::stuck::{StuckAction, StuckReason};
use crate::model::{EscalationType, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DaemonEvent {
    CycleStarted {
        cycle: u64,
    },
    GoalActivated {
        goal_id: String,
        work_items: usize,
    },
    PlanningFailed {
        goal_id: String,
        reason: String,
    },
    WorkItemStarted {
        goal_id: String,
        work_item_id: String,
        run_id: String,
        model: String,
    },
    WorkItemCompleted {
        goal_id: String,
        work_item_id: String,
        run_id: String,
        decision: Decision,
    },
    WorkItemFailed {
        goal_id: String,
        work_item_id: String,
        reason: String,
    },
    EscalationCreated {
        goal_id: String,
        work_item_id: String,
        escalation_id: String,
        escalation_type: EscalationType,
        severity: Severity,
    },
    GoalCompleted {
        goal_id: String,
    },
    BudgetWarning {
        goal_id: String,
        level: WarningLevel,
    },
    StuckDetected {
        goal_id: String,
        work_item_id: String,
        reason: StuckReason,
        action: StuckAction,
    },
    ReplanRequested {
        goal_id: String,
        work_item_id: String,
    },
    Stopped,
}

impl DaemonEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DaemonEvent::CycleStarted { .. } => "cycle_started",
            DaemonEvent::GoalActivated { .. } => "goal_activated",
            DaemonEvent::PlanningFailed { .. } => "planning_failed",
            DaemonEvent::WorkItemStarted { .. } => "work_item_started",
            DaemonEvent::WorkItemCompleted { .. } => "work_item_completed",
            DaemonEvent::WorkItemFailed { .. } => "work_item_failed",
            DaemonEvent::EscalationCreated { .. } => "escalation_created",
            DaemonEvent::GoalCompleted { .. } => "goal_completed",
            DaemonEvent::BudgetWarning { .. } => "budget_warning",
            DaemonEvent::StuckDetected { .. } => "stuck_detected",
            DaemonEvent::ReplanRequested { .. } => "replan_requested",
            DaemonEvent::Stopped => "stopped",
        }
    }
}

/// Bounded broadcast of [`DaemonEvent`]s. Slow subscribers lag and lose
/// the oldest events; the daemon never blocks on them.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<DaemonEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DaemonEvent) {
        trace!(event_type = event.event_type(), "emit");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
