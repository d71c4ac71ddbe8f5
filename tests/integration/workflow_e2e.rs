//! End-to-end scheduling tests.

use cadence::core::{GraphStatus, NodeId, NodeStatus, Priority, TaskSpec};
use cadence::config::EngineConfig;
use cadence::state::checkpoint::{EXECUTION_START, INITIALIZED};

use crate::fixtures::{chain_abc, fan_out, fast_config, login_form, Harness, MockExecutor};

fn position(order: &[String], id: &str) -> usize {
    order
        .iter()
        .position(|n| n == id)
        .unwrap_or_else(|| panic!("{} was never dispatched", id))
}

/// Given a single task
/// When the project runs with a passing executor
/// Then all five nodes complete in checkpoint order
#[tokio::test(start_paused = true)]
async fn test_single_task_project_completes() {
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("login", &login_form(), fast_config(), executor.clone());

    assert_eq!(harness.scheduler.graph().node_count(), 5);
    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(report.completed, 5);
    assert_eq!(report.progress, 100.0);
    assert_eq!(report.error_count, 0);
    assert_eq!(
        executor.order(),
        vec![
            "login",
            "login-code-review",
            "login-qa",
            "final-code-review",
            "final-qa"
        ]
    );

    let review_prompt = &executor.prompts("login-code-review")[0];
    assert!(review_prompt.contains("Build login form"));

    let checkpoints = harness.scheduler.checkpoints();
    assert!(checkpoints.get(INITIALIZED).is_some());
    assert!(checkpoints.get(EXECUTION_START).is_some());
    assert!(checkpoints.latest_automatic().is_some());

    let sink = harness.finish();
    assert_eq!(sink.count("node_dispatched"), 5);
    assert_eq!(sink.count("node_completed"), 5);
    assert_eq!(sink.count("execution_finished"), 1);
    assert_eq!(sink.count("graph_status_changed"), 2);
}

/// Given A -> B -> C
/// When the project runs
/// Then each task waits for the QA node of its dependency
#[tokio::test(start_paused = true)]
async fn test_chain_respects_checkpoints() {
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("chain", &chain_abc(), fast_config(), executor.clone());
    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(report.total, 11);

    let order = executor.order();
    assert!(position(&order, "a-qa") < position(&order, "b"));
    assert!(position(&order, "b-qa") < position(&order, "c"));
    assert!(position(&order, "c-qa") < position(&order, "final-code-review"));
    assert_eq!(order.last().map(String::as_str), Some("final-qa"));
}

/// Given six independent tasks and max_parallelism 3
/// When the project runs
/// Then no more than three executor calls overlap, and three do
#[tokio::test(start_paused = true)]
async fn test_parallelism_is_bounded() {
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("fan", &fan_out(6), fast_config(), executor.clone());
    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(report.completed, 6 * 3 + 2);
    assert_eq!(executor.peak_concurrency(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_runs_serially() {
    let config = EngineConfig {
        max_parallelism: 1,
        ..fast_config()
    };
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("serial", &fan_out(3), config, executor.clone());
    harness.scheduler.run().await.unwrap();
    assert_eq!(executor.peak_concurrency(), 1);
}

/// Given tasks of mixed priority that become ready together
/// When only one slot is free
/// Then the critical task is dispatched first
#[tokio::test(start_paused = true)]
async fn test_priority_orders_ready_set() {
    let config = EngineConfig {
        max_parallelism: 1,
        ..fast_config()
    };
    let tasks = vec![
        TaskSpec::new("low", "Tidy docs").with_priority(Priority::Low),
        TaskSpec::new("urgent", "Fix outage").with_priority(Priority::Critical),
        TaskSpec::new("normal", "Add endpoint"),
    ];
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("prio", &tasks, config, executor.clone());

    let ready = harness.scheduler.ready_nodes();
    assert_eq!(
        ready,
        vec![NodeId::from("urgent"), NodeId::from("normal"), NodeId::from("low")]
    );

    harness.scheduler.run().await.unwrap();
    assert_eq!(executor.order()[0], "urgent");
}

/// Given a plan where two tasks depend on each other
/// When the project runs
/// Then the cycle iterates up to its bound and the graph still completes
#[tokio::test(start_paused = true)]
async fn test_mutual_dependency_is_bounded() {
    let config = EngineConfig {
        max_cyclical_iterations: 2,
        ..fast_config()
    };
    let tasks = vec![
        TaskSpec::new("api", "Build API").with_dependencies(&["client"]),
        TaskSpec::new("client", "Build client").with_dependencies(&["api"]),
    ];
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("cycle", &tasks, config, executor.clone());
    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(executor.prompts("api").len(), 3);
    assert_eq!(executor.prompts("final-qa").len(), 1);

    let closing = harness
        .scheduler
        .graph()
        .edges()
        .find(|e| e.closes_cycle)
        .cloned()
        .unwrap();
    assert_eq!(closing.current_iteration, 2);
    assert_eq!(closing.history.len(), 3);
    assert!(harness
        .scheduler
        .nodes()
        .values()
        .all(|s| s.status == NodeStatus::Completed));
}
