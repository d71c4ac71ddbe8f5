//! Cycle detection over the built graph.
//!
//! Runs once after construction. An iterative depth-first search keeps the
//! active path on an explicit stack; any edge into a node still on that path
//! closes a cycle. Edges on detected cycles are flagged cyclical and given a
//! purpose derived from the node types on the cycle.

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conditions::Condition;
use crate::core::graph::{EdgeId, TaskGraph};
use crate::core::task::{NodeId, NodeType};

/// Why a cycle exists, which selects the extra condition its closing edge
/// must satisfy on each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePurpose {
    /// Review and QA nodes both on the cycle.
    QualityIteration,
    /// Review without QA.
    ReviewCycle,
    /// QA without review.
    TestFixCycle,
    General,
}

impl CyclePurpose {
    pub fn classify<'a>(node_types: impl IntoIterator<Item = &'a NodeType>) -> Self {
        let mut review = false;
        let mut qa = false;
        for node_type in node_types {
            match node_type {
                NodeType::CodeReview => review = true,
                NodeType::QaTesting => qa = true,
                NodeType::Standard => {}
            }
        }
        match (review, qa) {
            (true, true) => CyclePurpose::QualityIteration,
            (true, false) => CyclePurpose::ReviewCycle,
            (false, true) => CyclePurpose::TestFixCycle,
            (false, false) => CyclePurpose::General,
        }
    }

    /// The extra condition attached to a cyclical evaluation.
    pub fn condition(&self, quality_threshold: f64, max_sub_iterations: u32) -> Condition {
        match self {
            CyclePurpose::QualityIteration => Condition::QualityImprovement {
                threshold: quality_threshold,
            },
            CyclePurpose::ReviewCycle => Condition::ReviewFeedback,
            CyclePurpose::TestFixCycle => Condition::TestConvergence,
            CyclePurpose::General => Condition::GeneralImprovement { max_sub_iterations },
        }
    }
}

impl std::fmt::Display for CyclePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePurpose::QualityIteration => write!(f, "quality_iteration"),
            CyclePurpose::ReviewCycle => write!(f, "review_cycle"),
            CyclePurpose::TestFixCycle => write!(f, "test_fix_cycle"),
            CyclePurpose::General => write!(f, "general"),
        }
    }
}

/// A cycle found by the search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedCycle {
    /// Nodes in path order, starting at the node the back edge returns to.
    pub nodes: Vec<NodeId>,
    /// Edges in path order; the last one is the closing edge.
    pub edges: Vec<EdgeId>,
    pub closing_edge: EdgeId,
    pub purpose: CyclePurpose,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct Frame {
    node: NodeIndex,
    via: Option<EdgeIndex>,
    edges: Vec<(EdgeIndex, NodeIndex)>,
    next: usize,
}

fn frame(graph: &TaskGraph, node: NodeIndex, via: Option<EdgeIndex>) -> Frame {
    let mut edges: Vec<(EdgeIndex, NodeIndex)> = graph
        .inner()
        .edges_directed(node, Direction::Outgoing)
        .map(|e| (e.id(), e.target()))
        .collect();
    // insertion order keeps the search deterministic
    edges.reverse();
    Frame {
        node,
        via,
        edges,
        next: 0,
    }
}

/// Find every cycle reachable by back edges, visiting roots in insertion order.
pub fn detect_cycles(graph: &TaskGraph) -> Vec<DetectedCycle> {
    let inner = graph.inner();
    let mut color = vec![Color::White; inner.node_count()];
    let mut cycles = Vec::new();

    for root in inner.node_indices() {
        if color[root.index()] != Color::White {
            continue;
        }
        color[root.index()] = Color::Gray;
        let mut stack = vec![frame(graph, root, None)];

        loop {
            let step = match stack.last_mut() {
                Some(top) if top.next < top.edges.len() => {
                    let step = top.edges[top.next];
                    top.next += 1;
                    Some(step)
                }
                Some(_) => None,
                None => break,
            };

            let Some((edge, target)) = step else {
                if let Some(done) = stack.pop() {
                    color[done.node.index()] = Color::Black;
                }
                continue;
            };

            match color[target.index()] {
                Color::White => {
                    color[target.index()] = Color::Gray;
                    stack.push(frame(graph, target, Some(edge)));
                }
                Color::Gray => {
                    if let Some(cycle) = describe_cycle(graph, &stack, target, edge) {
                        debug!(
                            closing = %cycle.closing_edge,
                            length = cycle.nodes.len(),
                            "back edge found"
                        );
                        cycles.push(cycle);
                    }
                }
                Color::Black => {}
            }
        }
    }

    cycles
}

fn describe_cycle(
    graph: &TaskGraph,
    stack: &[Frame],
    target: NodeIndex,
    closing: EdgeIndex,
) -> Option<DetectedCycle> {
    let inner = graph.inner();
    let start = stack.iter().position(|f| f.node == target)?;
    let path = &stack[start..];

    let nodes: Vec<NodeId> = path
        .iter()
        .filter_map(|f| inner.node_weight(f.node))
        .map(|n| n.id.clone())
        .collect();
    let mut edges: Vec<EdgeId> = path
        .iter()
        .skip(1)
        .filter_map(|f| f.via)
        .filter_map(|e| inner.edge_weight(e))
        .map(|e| e.id.clone())
        .collect();
    let closing_edge = inner.edge_weight(closing)?.id.clone();
    edges.push(closing_edge.clone());

    let purpose = CyclePurpose::classify(
        path.iter()
            .filter_map(|f| inner.node_weight(f.node))
            .map(|n| &n.node_type),
    );

    Some(DetectedCycle {
        nodes,
        edges,
        closing_edge,
        purpose,
    })
}

/// Detect cycles and flag their edges in place.
///
/// Every edge on a cycle becomes cyclical with the cycle's purpose and the
/// iteration bound; the closing edge also records the cycle's nodes. An edge
/// shared by several cycles keeps the first purpose assigned to it.
pub fn mark_cyclical_edges(graph: &mut TaskGraph, max_iterations: u32) -> Vec<DetectedCycle> {
    let cycles = detect_cycles(graph);

    for cycle in &cycles {
        for edge_id in &cycle.edges {
            if let Some(edge) = graph.edge_mut(edge_id) {
                if !edge.is_cyclical {
                    edge.is_cyclical = true;
                    edge.cycle_purpose = Some(cycle.purpose);
                    edge.max_iterations = max_iterations;
                }
            }
        }
        if let Some(edge) = graph.edge_mut(&cycle.closing_edge) {
            edge.closes_cycle = true;
            edge.cycle_nodes = cycle.nodes.clone();
        }
        info!(
            closing = %cycle.closing_edge,
            purpose = %cycle.purpose,
            nodes = cycle.nodes.len(),
            "cyclical edges flagged"
        );
    }

    cycles
}
