//! Ordered recovery after an unrecoverable scheduler error.
//!
//! Strategies are tried in order until one yields a state that validates:
//!
//! 1. the `execution_start` checkpoint
//! 2. timeline rollback: every node started after the latest completed
//!    node's end time goes back to `pending` with its errors cleared
//! 3. the newest automatic snapshot
//! 4. the `initialized` checkpoint
//!
//! Whatever is restored, nodes that were `running` in it are put back to
//! `pending`: their dispatches belong to an earlier epoch and are discarded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::core::graph::{GraphState, GraphStatus};
use crate::core::task::{NodeId, NodeState, NodeStatus};
use crate::error::{Error, Result};
use crate::state::checkpoint::{CheckpointStore, RestoredState, EXECUTION_START, INITIALIZED};
use crate::state::memory::{MemoryBank, RECOVERY_LOG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ExecutionStart,
    TimelineRollback,
    LatestSnapshot,
    Initialized,
}

impl RecoveryStrategy {
    pub const ORDER: [RecoveryStrategy; 4] = [
        RecoveryStrategy::ExecutionStart,
        RecoveryStrategy::TimelineRollback,
        RecoveryStrategy::LatestSnapshot,
        RecoveryStrategy::Initialized,
    ];
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::ExecutionStart => write!(f, "execution_start"),
            RecoveryStrategy::TimelineRollback => write!(f, "timeline_rollback"),
            RecoveryStrategy::LatestSnapshot => write!(f, "latest_snapshot"),
            RecoveryStrategy::Initialized => write!(f, "initialized"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAttempt {
    pub strategy: RecoveryStrategy,
    /// `None` when the strategy succeeded.
    pub error: Option<String>,
}

/// Outcome of [`recover`].
#[derive(Debug, Clone)]
pub struct Recovery {
    pub attempts: Vec<RecoveryAttempt>,
    pub restored: Option<(RecoveryStrategy, RestoredState)>,
}

impl Recovery {
    /// # Errors
    /// `RecoveryExhausted` when no strategy produced a valid state.
    pub fn into_result(self) -> Result<(RecoveryStrategy, RestoredState)> {
        let attempts = self.attempts.len();
        self.restored
            .ok_or(Error::RecoveryExhausted { attempts })
    }
}

/// Live state the ladder starts from.
#[derive(Debug, Clone, Copy)]
pub struct LiveState<'a> {
    pub graph: &'a GraphState,
    pub nodes: &'a BTreeMap<NodeId, NodeState>,
    pub memory: &'a MemoryBank,
    pub node_ids: &'a BTreeSet<NodeId>,
}

/// Roll back every node that started after the latest completion.
///
/// With no completed node at all, every started node is rolled back.
pub fn timeline_rollback(
    graph: &GraphState,
    nodes: &BTreeMap<NodeId, NodeState>,
) -> (GraphState, BTreeMap<NodeId, NodeState>) {
    let cutoff = nodes
        .values()
        .filter(|n| n.status == NodeStatus::Completed)
        .filter_map(|n| n.ended_at)
        .max();

    let mut graph = graph.clone();
    let mut nodes = nodes.clone();
    for (id, state) in nodes.iter_mut() {
        let Some(started) = state.started_at else {
            continue;
        };
        if cutoff.map_or(true, |c| started > c) {
            state.reset(true);
            graph.mark_pending(id);
        }
    }
    (graph, nodes)
}

/// Put restored `running` nodes back to `pending` and resume as `executing`.
pub fn normalize(graph: &mut GraphState, nodes: &mut BTreeMap<NodeId, NodeState>) {
    for (id, state) in nodes.iter_mut() {
        if state.status == NodeStatus::Running {
            state.reset(false);
            graph.mark_pending(id);
        }
    }
    graph.current_nodes.clear();
    graph.status = GraphStatus::Executing;
    graph.update_progress();
}

fn attempt(
    strategy: RecoveryStrategy,
    store: &mut CheckpointStore,
    live: &LiveState<'_>,
) -> Result<RestoredState> {
    let mut restored = match strategy {
        RecoveryStrategy::ExecutionStart => store.restore(EXECUTION_START, live.node_ids, live.memory)?,
        RecoveryStrategy::Initialized => store.restore(INITIALIZED, live.node_ids, live.memory)?,
        RecoveryStrategy::LatestSnapshot => {
            let name = store
                .latest_automatic()
                .map(|c| c.name.clone())
                .ok_or_else(|| Error::Checkpoint("no automatic snapshot".to_string()))?;
            store.restore(&name, live.node_ids, live.memory)?
        }
        RecoveryStrategy::TimelineRollback => {
            let (graph, nodes) = timeline_rollback(live.graph, live.nodes);
            RestoredState {
                name: strategy.to_string(),
                version: store.live_version(),
                graph,
                nodes,
                memory: live.memory.clone(),
            }
        }
    };

    normalize(&mut restored.graph, &mut restored.nodes);
    if let Some(missing) = live.node_ids.iter().find(|id| !restored.nodes.contains_key(*id)) {
        return Err(Error::Checkpoint(format!("no state for node {}", missing)));
    }
    restored
        .graph
        .check_invariants(&restored.nodes)
        .map_err(|e| Error::Checkpoint(format!("{}: {}", strategy, e)))?;
    Ok(restored)
}

/// Walk the recovery ladder.
///
/// Every attempt is logged in the restored memory bank's recovery log.
pub fn recover(store: &mut CheckpointStore, live: LiveState<'_>) -> Recovery {
    let mut attempts = Vec::new();
    for strategy in RecoveryStrategy::ORDER {
        match attempt(strategy, store, &live) {
            Ok(mut restored) => {
                info!(%strategy, version = restored.version, "recovery succeeded");
                attempts.push(RecoveryAttempt {
                    strategy,
                    error: None,
                });
                restored.memory.append(
                    RECOVERY_LOG,
                    serde_json::json!({
                        "strategy": strategy,
                        "version": restored.version,
                        "failed_before": attempts.len() - 1,
                    }),
                );
                return Recovery {
                    attempts,
                    restored: Some((strategy, restored)),
                };
            }
            Err(e) => {
                warn!(%strategy, error = %e, "recovery strategy failed");
                attempts.push(RecoveryAttempt {
                    strategy,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    Recovery {
        attempts,
        restored: None,
    }
}
