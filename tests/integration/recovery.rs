//! Checkpoint restore and recovery ladder tests.

use chrono::{Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};

use cadence::core::{GraphState, GraphStatus, NodeId, NodeState, NodeStatus};
use cadence::state::checkpoint::{CheckpointStore, EXECUTION_START, INITIALIZED};
use cadence::state::memory::{MemoryBank, RECOVERY_LOG};
use cadence::state::recovery::{recover, LiveState};
use cadence::state::RecoveryStrategy;
use cadence::Error;

use crate::fixtures::{chain_abc, fast_config, login_form, Harness, MockExecutor};

/// Given a finished project
/// When the execution_start checkpoint is restored
/// Then every node is pending again and a second run repeats the work
#[tokio::test(start_paused = true)]
async fn test_restore_execution_start_reruns() {
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("rerun", &login_form(), fast_config(), executor.clone());
    harness.scheduler.run().await.unwrap();
    assert_eq!(executor.call_count(), 5);

    harness.scheduler.restore_checkpoint(EXECUTION_START).unwrap();
    assert_eq!(harness.scheduler.state().status, GraphStatus::Executing);
    assert!(harness
        .scheduler
        .nodes()
        .values()
        .all(|s| s.status == NodeStatus::Pending));
    // history recorded after the snapshot survives the restore
    assert_eq!(harness.scheduler.memory().executions().len(), 5);

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(executor.call_count(), 10);
    assert_eq!(harness.scheduler.memory().executions().len(), 10);

    let sink = harness.finish();
    assert_eq!(sink.count("checkpoint_restored"), 1);
}

/// Given a checkpoint taken while a node was running
/// When another scheduler adopts it
/// Then the orphaned node goes back to pending and runs exactly once
#[tokio::test(start_paused = true)]
async fn test_adopt_reclaims_running_node() {
    let executor = MockExecutor::passing();
    let mut harness = Harness::new("handoff", &chain_abc(), fast_config(), executor.clone());

    let mut checkpoint = harness
        .scheduler
        .checkpoints()
        .get(INITIALIZED)
        .cloned()
        .unwrap();
    let a = NodeId::from("a");
    checkpoint.name = "handoff".to_string();
    checkpoint.graph.status = GraphStatus::Executing;
    checkpoint.nodes.get_mut(&a).unwrap().start("developer").unwrap();
    checkpoint.graph.mark_running(&a).unwrap();

    harness.scheduler.adopt(checkpoint).unwrap();
    assert_eq!(
        harness.scheduler.node_state(&a).unwrap().status,
        NodeStatus::Pending
    );
    assert!(harness.scheduler.state().current_nodes.is_empty());

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(executor.prompts("a").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adopt_rejects_corrupt_checkpoint() {
    let mut harness = Harness::new(
        "corrupt",
        &login_form(),
        fast_config(),
        MockExecutor::passing(),
    );
    let mut checkpoint = harness
        .scheduler
        .checkpoints()
        .get(INITIALIZED)
        .cloned()
        .unwrap();
    checkpoint.name = "broken".to_string();
    checkpoint.nodes.remove(&NodeId::from("login-qa"));

    let err = harness.scheduler.adopt(checkpoint).unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)));
    assert!(harness.scheduler.checkpoints().get("broken").is_none());
    assert_eq!(harness.scheduler.state().status, GraphStatus::Initialized);
}

// ---- ladder

fn ids(list: &[&str]) -> BTreeSet<NodeId> {
    list.iter().map(|s| NodeId::from(*s)).collect()
}

/// Given a corrupt execution_start checkpoint and a live state where one
/// node finished and another started afterwards
/// When the recovery ladder runs
/// Then the timeline rollback wins and only the later node is reset
#[test]
fn test_ladder_falls_through_to_timeline_rollback() {
    let node_ids = ids(&["a", "b", "c"]);
    let fresh: BTreeMap<NodeId, NodeState> = node_ids
        .iter()
        .map(|id| (id.clone(), NodeState::default()))
        .collect();
    let mut store = CheckpointStore::new(10);
    let memory = MemoryBank::new();
    store.create(INITIALIZED, &GraphState::new(3, 2), &fresh, &memory);

    let mut corrupt = fresh.clone();
    corrupt.remove(&NodeId::from("c"));
    store.create(EXECUTION_START, &GraphState::new(3, 2), &corrupt, &memory);

    let now = Utc::now();
    let mut nodes = fresh.clone();
    let a = nodes.get_mut(&NodeId::from("a")).unwrap();
    a.status = NodeStatus::Completed;
    a.started_at = Some(now - Duration::seconds(60));
    a.ended_at = Some(now - Duration::seconds(30));
    let b = nodes.get_mut(&NodeId::from("b")).unwrap();
    b.status = NodeStatus::Running;
    b.started_at = Some(now - Duration::seconds(10));

    let mut graph = GraphState::new(3, 2);
    graph.status = GraphStatus::Executing;
    graph.mark_completed(&NodeId::from("a"));
    graph.mark_running(&NodeId::from("b")).unwrap();

    let recovery = recover(
        &mut store,
        LiveState {
            graph: &graph,
            nodes: &nodes,
            memory: &memory,
            node_ids: &node_ids,
        },
    );
    assert_eq!(recovery.attempts.len(), 2);
    assert!(recovery.attempts[0].error.is_some());

    let (strategy, restored) = recovery.into_result().unwrap();
    assert_eq!(strategy, RecoveryStrategy::TimelineRollback);
    assert_eq!(restored.nodes[&NodeId::from("a")].status, NodeStatus::Completed);
    assert_eq!(restored.nodes[&NodeId::from("b")].status, NodeStatus::Pending);
    assert!(restored.graph.current_nodes.is_empty());
    assert_eq!(restored.graph.status, GraphStatus::Executing);

    let log = restored.memory.entries(RECOVERY_LOG);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].data["strategy"], "timeline_rollback");
    assert_eq!(log[0].data["failed_before"], 1);
}
