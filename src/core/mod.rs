//! Core domain model: tasks, the dependency graph, checkpoint injection and
//! cycle detection.

pub mod builder;
pub mod cycles;
pub mod graph;
pub mod task;

pub use builder::{BuiltGraph, CheckpointPair, GraphBuilder};
pub use cycles::{CyclePurpose, DetectedCycle};
pub use graph::{Edge, EdgeId, EdgeType, GraphState, GraphStatus, TaskGraph};
pub use task::{NodeId, NodeState, NodeStatus, NodeType, Priority, TaskNode, TaskSpec};
