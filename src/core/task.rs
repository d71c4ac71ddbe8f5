//! Task data model for the orchestration graph.
//!
//! A `TaskSpec` is what callers hand in. The builder turns each spec into a
//! `TaskNode` (the immutable definition living in the graph) and the scheduler
//! keeps a `NodeState` per node for everything that changes while running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Identifier of a node in the task graph.
///
/// Input tasks keep the id they were declared with; injected checkpoint
/// nodes derive theirs from the task they verify.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of work a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Standard,
    CodeReview,
    QaTesting,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Standard => write!(f, "standard"),
            NodeType::CodeReview => write!(f, "code_review"),
            NodeType::QaTesting => write!(f, "qa_testing"),
        }
    }
}

/// Which quality gate a checkpoint node implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    CodeReview,
    QaTesting,
    FinalCodeReview,
    FinalQa,
}

impl CheckpointType {
    pub fn node_type(&self) -> NodeType {
        match self {
            CheckpointType::CodeReview | CheckpointType::FinalCodeReview => NodeType::CodeReview,
            CheckpointType::QaTesting | CheckpointType::FinalQa => NodeType::QaTesting,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, CheckpointType::FinalCodeReview | CheckpointType::FinalQa)
    }

    /// Skills a worker needs to sign off on this gate.
    pub fn gate_skills(&self) -> &'static [&'static str] {
        match self {
            CheckpointType::CodeReview | CheckpointType::FinalCodeReview => &["code-review"],
            CheckpointType::QaTesting | CheckpointType::FinalQa => &["testing", "qa"],
        }
    }

    /// Text matched against worker task patterns in place of the node title.
    pub fn label(&self) -> &'static str {
        match self {
            CheckpointType::CodeReview | CheckpointType::FinalCodeReview => "code review",
            CheckpointType::QaTesting | CheckpointType::FinalQa => "qa testing",
        }
    }
}

/// Declared task priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank, 0 (low) to 3 (critical).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Status of a node in its lifecycle.
///
/// `pending -> running -> {completed, failed}`, `failed -> retry -> pending`
/// while retries remain, `failed -> blocked` once they are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    Retry,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Blocked => write!(f, "blocked"),
            NodeStatus::Retry => write!(f, "retry"),
        }
    }
}

impl NodeStatus {
    /// Check whether `self -> target` is a legal step of the node state machine.
    ///
    /// `running -> pending` covers a dispatch cancelled by a forced pause.
    pub fn can_transition(&self, target: NodeStatus) -> bool {
        matches!(
            (self, target),
            (NodeStatus::Pending, NodeStatus::Running)
                | (NodeStatus::Running, NodeStatus::Completed)
                | (NodeStatus::Running, NodeStatus::Failed)
                | (NodeStatus::Running, NodeStatus::Pending)
                | (NodeStatus::Failed, NodeStatus::Retry)
                | (NodeStatus::Failed, NodeStatus::Blocked)
                | (NodeStatus::Retry, NodeStatus::Pending)
        )
    }
}

/// A task as declared by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: NodeId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub priority: Priority,
    /// Estimated effort in hours.
    #[serde(default)]
    pub estimated_effort: f64,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub is_checkpoint: bool,
    #[serde(default)]
    pub checkpoint_type: Option<CheckpointType>,
    #[serde(default)]
    pub original_task_id: Option<NodeId>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: NodeId::from(id),
            title: title.to_string(),
            description: String::new(),
            node_type: NodeType::Standard,
            priority: Priority::Medium,
            estimated_effort: 1.0,
            required_skills: Vec::new(),
            dependencies: Vec::new(),
            is_checkpoint: false,
            checkpoint_type: None,
            original_task_id: None,
            max_retries: None,
        }
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.required_skills = skills.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| NodeId::from(*d)).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Immutable definition of a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: NodeId,
    pub title: String,
    pub description: String,
    pub node_type: NodeType,
    pub priority: Priority,
    pub estimated_effort: f64,
    pub required_skills: BTreeSet<String>,
    pub dependencies: BTreeSet<NodeId>,
    pub is_checkpoint: bool,
    pub checkpoint_type: Option<CheckpointType>,
    /// Set on injected checkpoint nodes: the task they verify.
    pub original_task_id: Option<NodeId>,
    pub max_retries: u32,
}

impl TaskNode {
    pub fn from_spec(spec: &TaskSpec, default_max_retries: u32) -> Self {
        Self {
            id: spec.id.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            node_type: spec.node_type,
            priority: spec.priority,
            estimated_effort: spec.estimated_effort,
            required_skills: spec.required_skills.iter().cloned().collect(),
            dependencies: spec.dependencies.iter().cloned().collect(),
            is_checkpoint: spec.is_checkpoint,
            checkpoint_type: spec.checkpoint_type,
            original_task_id: spec.original_task_id.clone(),
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
        }
    }

    /// Create an injected checkpoint node.
    pub fn checkpoint(
        id: NodeId,
        title: String,
        checkpoint_type: CheckpointType,
        original: Option<&TaskNode>,
        dependencies: BTreeSet<NodeId>,
        max_retries: u32,
    ) -> Self {
        let (description, priority) = match original {
            Some(task) => (
                format!("{}\n\nVerified task: {}", task.description, task.title),
                task.priority,
            ),
            None => (String::new(), Priority::High),
        };
        let skills = checkpoint_type
            .gate_skills()
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            id,
            title,
            description,
            node_type: checkpoint_type.node_type(),
            priority,
            estimated_effort: 0.5,
            required_skills: skills,
            dependencies,
            is_checkpoint: true,
            checkpoint_type: Some(checkpoint_type),
            original_task_id: original.map(|t| t.id.clone()),
            max_retries,
        }
    }
}

/// Mutable per-node execution state, owned by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub quality_score: Option<f64>,
    pub retry_count: u32,
    pub error_history: Vec<String>,
    /// Set when a node was completed without a genuine result (timeout).
    pub warning: Option<String>,
    /// Extra instructions for the next dispatch (retry or rework).
    pub remediation: Option<String>,
}

impl NodeState {
    /// Apply a state-machine transition, rejecting illegal ones.
    pub fn transition(&mut self, target: NodeStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    pub fn start(&mut self, worker: &str) -> Result<()> {
        self.transition(NodeStatus::Running)?;
        self.assigned_worker = Some(worker.to_string());
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.duration_ms = None;
        self.warning = None;
        Ok(())
    }

    pub fn finish(&mut self, status: NodeStatus, duration_ms: u64) -> Result<()> {
        self.transition(status)?;
        self.ended_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    /// Force the node back to `pending` for rework, rollback or recovery.
    ///
    /// Keeps the retry count; callers decide whether history is cleared.
    pub fn reset(&mut self, clear_errors: bool) {
        self.status = NodeStatus::Pending;
        self.assigned_worker = None;
        self.started_at = None;
        self.ended_at = None;
        self.duration_ms = None;
        self.quality_score = None;
        self.warning = None;
        if clear_errors {
            self.error_history.clear();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }

    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}
