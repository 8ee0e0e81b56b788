//! Daemon lifecycle tests against the in-memory repository.
//!
//! Cycle-level tests call `run_cycle` directly for determinism; loop-level
//! tests spawn `start` and drive it through `stop` or goal cancellation.

use std::sync::Arc;
use std::time::Duration;

use fleet::core::decision::Decision;
use fleet::daemon::{Collaborators, Daemon};
use fleet::events::DaemonEvent;
use fleet::io::collaborators::{Plan, PlannedDependency};
use fleet::io::config::FleetConfig;
use fleet::io::memory_store::MemoryRepository;
use fleet::io::repository::Repository;
use fleet::io::snapshot::load_snapshot;
use fleet::model::{
    EscalationType, GoalStatus, RunStatus, Severity, VerificationStatus, WorkItemStatus,
};
use fleet::test_support::{
    DEFAULT_TOKENS, ScriptedEvaluator, ScriptedExecutor, ScriptedPlanner, ScriptedVerifier,
    TestFleet, goal, item_with_status, planned,
};

fn two_step_plan() -> Plan {
    Plan {
        work_items: vec![planned("a"), planned("b")],
        dependencies: vec![PlannedDependency {
            from: "b".to_string(),
            on: "a".to_string(),
        }],
    }
}

fn fast_config(max_concurrent_runs: usize) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.daemon.max_concurrent_runs = max_concurrent_runs;
    config.daemon.polling_interval_ms = 10;
    config
}

/// Poll `done` every few milliseconds for up to two seconds.
async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}

/// A -> B: planning, promotion, dispatch, dependent release, goal completion.
///
/// Cycle 1 plans the goal, runs `a` and releases `b`; cycle 2 runs `b` and
/// completes the goal.
#[tokio::test]
async fn dependent_items_complete_in_order() {
    let fleet = TestFleet::with_config(fast_config(2));
    fleet.add_goal(goal("g"));
    fleet.planner.set_plan("g", two_step_plan());
    let mut events = fleet.daemon.subscribe();

    fleet.daemon.run_cycle().await.expect("cycle 1");
    assert_eq!(fleet.goal("g").status, GoalStatus::Active);
    assert_eq!(fleet.item("g/a").status, WorkItemStatus::Done);
    assert_eq!(fleet.item("g/a").verification_status, VerificationStatus::Passed);
    assert_eq!(fleet.item("g/b").status, WorkItemStatus::Ready);

    fleet.daemon.run_cycle().await.expect("cycle 2");
    assert_eq!(fleet.item("g/b").status, WorkItemStatus::Done);

    let g = fleet.goal("g");
    assert_eq!(g.status, GoalStatus::Completed);
    assert_eq!(g.spent_tokens, 2 * DEFAULT_TOKENS);

    let order: Vec<String> = fleet
        .executor
        .calls()
        .into_iter()
        .map(|call| call.work_item_id)
        .collect();
    assert_eq!(order, vec!["g/a".to_string(), "g/b".to_string()]);
    assert_eq!(fleet.planner.requests().len(), 1);

    let seen = TestFleet::drain(&mut events);
    assert!(seen.iter().any(|e| matches!(
        e,
        DaemonEvent::GoalActivated { work_items: 2, .. }
    )));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, DaemonEvent::WorkItemCompleted { decision: Decision::Publish, .. }))
            .count(),
        2
    );
    assert!(
        seen.iter()
            .any(|e| matches!(e, DaemonEvent::GoalCompleted { goal_id } if goal_id == "g"))
    );

    // Nothing left to do.
    fleet.daemon.run_cycle().await.expect("cycle 3");
    assert_eq!(fleet.executor.calls().len(), 2);
}

/// The same normalized error three times escalates once and blocks the item.
#[tokio::test]
async fn repeated_error_escalates_once() {
    let fleet = TestFleet::new();
    let mut item = item_with_status("g/c", "g", WorkItemStatus::Ready);
    item.max_retries = 5;
    fleet.add_active_goal_with_items("g", vec![item]);
    for (port, secs) in [(5432, 3), (5433, 5), (5434, 8)] {
        fleet.executor.push_report(
            "g/c",
            fleet::test_support::failure_report(&format!(
                "connection refused on port {port} after {secs}s"
            )),
        );
    }

    for cycle in 1..=2 {
        fleet.daemon.run_cycle().await.expect("retry cycle");
        let c = fleet.item("g/c");
        assert_eq!(c.status, WorkItemStatus::Ready, "cycle {cycle}");
        assert_eq!(c.retry_count, cycle);
    }

    fleet.daemon.run_cycle().await.expect("escalating cycle");
    let c = fleet.item("g/c");
    assert_eq!(c.status, WorkItemStatus::Blocked);
    assert_eq!(c.retry_count, 2);

    let escalations = fleet.repo.list_escalations(Some("g")).expect("escalations");
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].escalation_type, EscalationType::Stuck);
    assert_eq!(escalations[0].severity, Severity::High);
    assert_eq!(escalations[0].work_item_id, "g/c");

    let runs = fleet.runs("g/c");
    assert_eq!(
        runs.iter().map(|run| run.run_sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(runs.iter().all(|run| run.status == RunStatus::Failure));
    assert_eq!(escalations[0].run_id.as_deref(), Some(runs[2].id.as_str()));

    // Blocked items are not dispatched again.
    fleet.daemon.run_cycle().await.expect("idle cycle");
    assert_eq!(fleet.executor.calls().len(), 3);
}

/// Five ready items, two slots: never more than two runs in flight.
#[tokio::test]
async fn dispatch_respects_concurrency_bound() {
    let fleet = TestFleet::with_config(fast_config(2));
    let items = (1..=5)
        .map(|n| {
            let mut item = item_with_status(&format!("g/{n}"), "g", WorkItemStatus::Ready);
            item.priority = n * 10;
            item
        })
        .collect();
    fleet.add_active_goal_with_items("g", items);
    fleet.executor.set_delay(Duration::from_millis(20));

    fleet.daemon.run_cycle().await.expect("cycle 1");
    let first: Vec<String> = fleet
        .executor
        .calls()
        .into_iter()
        .map(|call| call.work_item_id)
        .collect();
    assert_eq!(first, vec!["g/5".to_string(), "g/4".to_string()]);
    assert_eq!(fleet.executor.max_in_flight(), 2);

    fleet.daemon.run_cycle().await.expect("cycle 2");
    fleet.daemon.run_cycle().await.expect("cycle 3");
    for n in 1..=5 {
        assert_eq!(fleet.item(&format!("g/{n}")).status, WorkItemStatus::Done);
    }
    assert_eq!(fleet.executor.calls().len(), 5);
    assert_eq!(fleet.executor.max_in_flight(), 2);
    assert_eq!(fleet.daemon.active_run_count(), 0);
    assert_eq!(fleet.goal("g").status, GoalStatus::Completed);
}

#[tokio::test]
async fn stop_aborts_active_runs() {
    let fleet = TestFleet::with_config(fast_config(2));
    fleet.add_active_goal_with_items("g", vec![item_with_status("g/a", "g", WorkItemStatus::Ready)]);
    fleet.executor.hang_on("g/a");
    let mut events = fleet.daemon.subscribe();

    let daemon = Arc::clone(&fleet.daemon);
    let handle = tokio::spawn(async move { daemon.start().await });
    let executor = Arc::clone(&fleet.executor);
    assert!(wait_until(|| executor.in_flight() == 1).await, "run never started");
    assert_eq!(fleet.daemon.active_run_count(), 1);
    assert!(fleet.daemon.is_running());

    fleet.daemon.stop();
    assert_eq!(fleet.daemon.active_run_count(), 0);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop exits")
        .expect("join")
        .expect("start result");
    assert!(!fleet.daemon.is_running());

    assert_eq!(fleet.item("g/a").status, WorkItemStatus::Ready);
    let runs = fleet.runs("g/a");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failure);
    assert_eq!(runs[0].error_message.as_deref(), Some("cancelled: daemon stopped"));

    let seen = TestFleet::drain(&mut events);
    assert!(matches!(seen.last(), Some(DaemonEvent::Stopped)));

    // Both are idempotent.
    fleet.daemon.stop();
    fleet.daemon.start().await.expect("start after stop");
    assert_eq!(fleet.executor.calls().len(), 1);
}

#[tokio::test]
async fn cancelled_goal_returns_items_to_ready() {
    let fleet = TestFleet::with_config(fast_config(2));
    fleet.add_active_goal_with_items("g", vec![item_with_status("g/a", "g", WorkItemStatus::Ready)]);
    fleet.executor.hang_on("g/a");

    let daemon = Arc::clone(&fleet.daemon);
    let handle = tokio::spawn(async move { daemon.start().await });
    let executor = Arc::clone(&fleet.executor);
    assert!(wait_until(|| executor.in_flight() == 1).await, "run never started");

    fleet.daemon.cancel_goal("g").expect("cancel");
    let repo = Arc::clone(&fleet.repo);
    assert!(
        wait_until(|| {
            repo.get_work_item("g/a")
                .ok()
                .flatten()
                .is_some_and(|item| item.status == WorkItemStatus::Ready)
        })
        .await
    );
    // A few idle cycles pass without redispatching the cancelled goal.
    tokio::time::sleep(Duration::from_millis(50)).await;

    fleet.daemon.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop exits")
        .expect("join")
        .expect("start result");

    assert_eq!(fleet.goal("g").status, GoalStatus::Cancelled);
    assert_eq!(fleet.executor.calls().len(), 1);
    let runs = fleet.runs("g/a");
    assert_eq!(runs[0].error_message.as_deref(), Some("cancelled: goal cancelled"));
}

#[tokio::test]
async fn stop_persists_state_to_snapshot() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("fleet.json");
    let repo = Arc::new(MemoryRepository::open(&path).expect("open"));
    repo.insert_goal(goal("g")).expect("goal");

    let planner = Arc::new(ScriptedPlanner::default());
    planner.set_plan("g", two_step_plan());
    let collaborators = Collaborators {
        planner,
        executor: Arc::new(ScriptedExecutor::default()),
        verifier: Arc::new(ScriptedVerifier::default()),
        evaluator: Arc::new(ScriptedEvaluator::default()),
    };
    let daemon = Arc::new(
        Daemon::new(fast_config(2), repo.clone(), collaborators).expect("daemon"),
    );

    let runner = Arc::clone(&daemon);
    let handle = tokio::spawn(async move { runner.start().await });
    let watched = Arc::clone(&repo);
    assert!(
        wait_until(|| {
            watched
                .get_goal("g")
                .ok()
                .flatten()
                .is_some_and(|g| g.status == GoalStatus::Completed)
        })
        .await
    );
    daemon.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop exits")
        .expect("join")
        .expect("start result");

    let persisted = load_snapshot(&path).expect("snapshot written on close");
    assert_eq!(persisted.goals[0].status, GoalStatus::Completed);
    assert_eq!(persisted.work_items.len(), 2);
    assert!(
        persisted
            .work_items
            .iter()
            .all(|item| item.status == WorkItemStatus::Done)
    );
    assert_eq!(persisted.runs.len(), 2);
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = FleetConfig::default();
    config.daemon.max_concurrent_runs = 0;
    let collaborators = Collaborators {
        planner: Arc::new(ScriptedPlanner::default()),
        executor: Arc::new(ScriptedExecutor::default()),
        verifier: Arc::new(ScriptedVerifier::default()),
        evaluator: Arc::new(ScriptedEvaluator::default()),
    };
    let err = Daemon::new(config, Arc::new(MemoryRepository::new()), collaborators)
        .err()
        .expect("invalid config");
    assert!(format!("{err:#}").contains("max_concurrent_runs"));
}
