//! Task graph and aggregate execution state.
//!
//! `TaskGraph` wraps a petgraph `DiGraph` whose nodes are task definitions and
//! whose edges carry traversal conditions. An edge always points from the node
//! that must finish first (source) to the node waiting on it (target).

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::conditions::{Condition, EvaluationRecord};
use crate::core::cycles::CyclePurpose;
use crate::core::task::{NodeId, NodeState, NodeStatus, TaskNode};
use crate::error::{Error, Result};

/// Identifier of an edge, `"<source>-><target>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn between(source: &NodeId, target: &NodeId) -> Self {
        Self(format!("{}->{}", source, target))
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Declared dependency between tasks (possibly rewritten to a QA node).
    Dependency,
    /// Task -> code review, code review -> QA.
    CheckpointDependency,
    /// QA -> final code review, final code review -> final QA.
    FinalReviewDependency,
}

/// A dependency edge with its ordered traversal conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub edge_type: EdgeType,
    pub conditions: Vec<Condition>,
    /// The edge lies on a detected cycle.
    pub is_cyclical: bool,
    /// The edge is the one that closes its cycle (DFS back edge).
    pub closes_cycle: bool,
    pub cycle_purpose: Option<CyclePurpose>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    /// Nodes re-opened when a closing edge passes, in cycle order.
    pub cycle_nodes: Vec<NodeId>,
    /// One record per evaluation of a cyclical edge.
    pub history: Vec<EvaluationRecord>,
}

impl Edge {
    pub fn new(
        source: NodeId,
        target: NodeId,
        edge_type: EdgeType,
        conditions: Vec<Condition>,
    ) -> Self {
        Self {
            id: EdgeId::between(&source, &target),
            source,
            target,
            edge_type,
            conditions,
            is_cyclical: false,
            closes_cycle: false,
            cycle_purpose: None,
            current_iteration: 0,
            max_iterations: 0,
            cycle_nodes: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<TaskNode, Edge>,
    node_index: HashMap<NodeId, NodeIndex>,
    edge_index: HashMap<EdgeId, EdgeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            edge_index: HashMap::new(),
        }
    }

    /// Add a node definition.
    ///
    /// # Errors
    /// Returns `GraphConstruction` if a node with the same id exists.
    pub fn add_node(&mut self, node: TaskNode) -> Result<NodeIndex> {
        if self.node_index.contains_key(&node.id) {
            return Err(Error::GraphConstruction(format!(
                "duplicate node id {}",
                node.id
            )));
        }
        let id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index.insert(id, index);
        Ok(index)
    }

    /// Add an edge from `source` (must finish first) to `target`.
    ///
    /// Cycles are allowed here; they are detected and flagged afterwards.
    pub fn add_edge(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        edge_type: EdgeType,
        conditions: Vec<Condition>,
    ) -> Result<EdgeIndex> {
        let from = self.index_of(source)?;
        let to = self.index_of(target)?;
        let edge = Edge::new(source.clone(), target.clone(), edge_type, conditions);
        if let Some(&existing) = self.edge_index.get(&edge.id) {
            return Ok(existing);
        }
        let id = edge.id.clone();
        let index = self.graph.add_edge(from, to, edge);
        self.edge_index.insert(id, index);
        Ok(index)
    }

    fn index_of(&self, id: &NodeId) -> Result<NodeIndex> {
        self.node_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::NodeNotFound(id.clone()))
    }

    pub fn node(&self, id: &NodeId) -> Option<&TaskNode> {
        self.node_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node_index.contains_key(id)
    }

    /// Node definitions in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.node_index.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edge_index
            .get(id)
            .and_then(|&index| self.graph.edge_weight(index))
    }

    pub fn edge_mut(&mut self, id: &EdgeId) -> Option<&mut Edge> {
        match self.edge_index.get(id) {
            Some(&index) => self.graph.edge_weight_mut(index),
            None => None,
        }
    }

    pub fn edge_between(&self, source: &NodeId, target: &NodeId) -> Option<&Edge> {
        self.edge(&EdgeId::between(source, target))
    }

    /// Edges whose target is `id`.
    pub fn incoming(&self, id: &NodeId) -> Vec<&Edge> {
        self.directed_edges(id, Direction::Incoming)
    }

    /// Edges whose source is `id`.
    pub fn outgoing(&self, id: &NodeId) -> Vec<&Edge> {
        self.directed_edges(id, Direction::Outgoing)
    }

    fn directed_edges(&self, id: &NodeId, direction: Direction) -> Vec<&Edge> {
        match self.node_index.get(id) {
            Some(&index) => {
                let mut edges: Vec<&Edge> = self
                    .graph
                    .edges_directed(index, direction)
                    .map(|e| e.weight())
                    .collect();
                // petgraph yields edges newest first
                edges.reverse();
                edges
            }
            None => Vec::new(),
        }
    }

    /// Ids of the nodes `id` waits on.
    pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
        self.incoming(id).into_iter().map(|e| e.source.clone()).collect()
    }

    /// Ids of the nodes waiting on `id`.
    pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
        self.outgoing(id).into_iter().map(|e| e.target.clone()).collect()
    }

    /// Direct access for pre-processing passes (cycle detection).
    pub(crate) fn inner(&self) -> &DiGraph<TaskNode, Edge> {
        &self.graph
    }

    pub(crate) fn inner_mut(&mut self) -> &mut DiGraph<TaskNode, Edge> {
        &mut self.graph
    }

    /// Projection of the graph without cyclical edges.
    fn acyclic_projection(&self) -> DiGraph<(), ()> {
        self.graph
            .filter_map(|_, _| Some(()), |_, e| (!e.is_cyclical).then_some(()))
    }

    /// True when the graph is a DAG once flagged cyclical edges are ignored.
    pub fn is_acyclic_ignoring_cyclical(&self) -> bool {
        !is_cyclic_directed(&self.acyclic_projection())
    }

    /// Node ids in dependency order, ignoring cyclical edges.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let projection = self.acyclic_projection();
        let sorted = toposort(&projection, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::GraphConstruction(format!("unflagged cycle at node {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .map(|n| n.id.clone())
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// Graph-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    #[default]
    Initialized,
    Executing,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphStatus::Initialized => write!(f, "initialized"),
            GraphStatus::Executing => write!(f, "executing"),
            GraphStatus::Paused => write!(f, "paused"),
            GraphStatus::Completed => write!(f, "completed"),
            GraphStatus::Failed => write!(f, "failed"),
        }
    }
}

impl GraphStatus {
    /// Valid transitions:
    /// - initialized -> executing | failed
    /// - executing -> paused | completed | failed
    /// - paused -> executing | failed
    /// - failed -> executing
    pub fn can_transition(&self, target: GraphStatus) -> bool {
        matches!(
            (self, target),
            (GraphStatus::Initialized, GraphStatus::Executing)
                | (GraphStatus::Initialized, GraphStatus::Failed)
                | (GraphStatus::Executing, GraphStatus::Paused)
                | (GraphStatus::Executing, GraphStatus::Completed)
                | (GraphStatus::Executing, GraphStatus::Failed)
                | (GraphStatus::Paused, GraphStatus::Executing)
                | (GraphStatus::Paused, GraphStatus::Failed)
                | (GraphStatus::Failed, GraphStatus::Executing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GraphStatus::Completed | GraphStatus::Failed)
    }
}

/// Aggregate execution state of one project graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub status: GraphStatus,
    pub current_nodes: BTreeSet<NodeId>,
    pub completed_nodes: BTreeSet<NodeId>,
    pub failed_nodes: BTreeSet<NodeId>,
    /// Ready set computed on the last scheduler pass.
    pub available_nodes: Vec<NodeId>,
    pub max_parallelism: usize,
    pub error_count: u32,
    pub retry_count: u32,
    pub total_nodes: usize,
    /// Percentage of nodes completed, 0-100.
    pub progress: f64,
}

impl GraphState {
    pub fn new(total_nodes: usize, max_parallelism: usize) -> Self {
        Self {
            status: GraphStatus::Initialized,
            current_nodes: BTreeSet::new(),
            completed_nodes: BTreeSet::new(),
            failed_nodes: BTreeSet::new(),
            available_nodes: Vec::new(),
            max_parallelism,
            error_count: 0,
            retry_count: 0,
            total_nodes,
            progress: 0.0,
        }
    }

    pub fn transition(&mut self, target: GraphStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Free dispatch slots under `max_parallelism`.
    pub fn free_slots(&self) -> usize {
        self.max_parallelism.saturating_sub(self.current_nodes.len())
    }

    fn remove_everywhere(&mut self, id: &NodeId) {
        self.current_nodes.remove(id);
        self.completed_nodes.remove(id);
        self.failed_nodes.remove(id);
    }

    pub fn mark_running(&mut self, id: &NodeId) -> Result<()> {
        if self.free_slots() == 0 {
            return Err(Error::Validation(format!(
                "cannot run {}: parallelism limit {} reached",
                id, self.max_parallelism
            )));
        }
        self.remove_everywhere(id);
        self.current_nodes.insert(id.clone());
        Ok(())
    }

    pub fn mark_completed(&mut self, id: &NodeId) {
        self.remove_everywhere(id);
        self.completed_nodes.insert(id.clone());
        self.update_progress();
    }

    pub fn mark_failed(&mut self, id: &NodeId) {
        self.remove_everywhere(id);
        self.failed_nodes.insert(id.clone());
        self.update_progress();
    }

    /// Drop a node from every set (it is pending again).
    pub fn mark_pending(&mut self, id: &NodeId) {
        self.remove_everywhere(id);
        self.update_progress();
    }

    pub fn update_progress(&mut self) {
        self.progress = if self.total_nodes == 0 {
            100.0
        } else {
            self.completed_nodes.len() as f64 / self.total_nodes as f64 * 100.0
        };
    }

    /// Check the structural invariants against the per-node state map.
    ///
    /// - `|current_nodes| <= max_parallelism`
    /// - the id sets are pairwise disjoint
    /// - every current node has status `running`
    /// - every id is known to the node-state map
    pub fn check_invariants(&self, nodes: &BTreeMap<NodeId, NodeState>) -> Result<()> {
        if self.current_nodes.len() > self.max_parallelism {
            return Err(Error::Validation(format!(
                "{} running nodes exceed max parallelism {}",
                self.current_nodes.len(),
                self.max_parallelism
            )));
        }
        let overlaps = self
            .current_nodes
            .intersection(&self.completed_nodes)
            .chain(self.current_nodes.intersection(&self.failed_nodes))
            .chain(self.completed_nodes.intersection(&self.failed_nodes))
            .next()
            .cloned();
        if let Some(id) = overlaps {
            return Err(Error::Validation(format!(
                "node {} appears in more than one state set",
                id
            )));
        }
        for id in self
            .current_nodes
            .iter()
            .chain(&self.completed_nodes)
            .chain(&self.failed_nodes)
        {
            if !nodes.contains_key(id) {
                return Err(Error::Validation(format!("unknown node {} in graph state", id)));
            }
        }
        for id in &self.current_nodes {
            let status = nodes.get(id).map(|n| n.status);
            if status != Some(NodeStatus::Running) {
                return Err(Error::Validation(format!(
                    "current node {} is not running",
                    id
                )));
            }
        }
        Ok(())
    }
}
