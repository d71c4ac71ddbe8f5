use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Graph construction failed: {0}")]
    GraphConstruction(String),

    #[error("Scheduler exceeded {iterations} loop iterations")]
    Scheduling { iterations: u64 },

    #[error("Execution of {node} failed: {reason}")]
    Execution { node: NodeId, reason: String },

    #[error("Quality gate failed for {node}: score {score:.2} below {threshold:.2}")]
    QualityGateFailure {
        node: NodeId,
        score: f64,
        threshold: f64,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Recovery exhausted after {attempts} strategies")]
    RecoveryExhausted { attempts: usize },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker {id} is at capacity (max: {max})")]
    WorkerAtCapacity { id: String, max: usize },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Executor binary not found: {0}")]
    ExecutorNotFound(String),

    #[error("No home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy reported in terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GraphConstruction,
    Scheduling,
    Execution,
    QualityGateFailure,
    Checkpoint,
    RecoveryExhausted,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::GraphConstruction => "graph_construction",
            ErrorKind::Scheduling => "scheduling",
            ErrorKind::Execution => "execution",
            ErrorKind::QualityGateFailure => "quality_gate_failure",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::RecoveryExhausted => "recovery_exhausted",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::GraphConstruction(_) => ErrorKind::GraphConstruction,
            Error::Scheduling { .. } => ErrorKind::Scheduling,
            Error::Execution { .. } | Error::Timeout(_) | Error::ExecutorNotFound(_) => {
                ErrorKind::Execution
            }
            Error::QualityGateFailure { .. } => ErrorKind::QualityGateFailure,
            Error::Checkpoint(_) => ErrorKind::Checkpoint,
            Error::RecoveryExhausted { .. } => ErrorKind::RecoveryExhausted,
            _ => ErrorKind::Internal,
        }
    }

    /// Fatal errors move the graph to `failed`; the rest are handled by
    /// remediation or the recovery ladder.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::GraphConstruction(_) | Error::Scheduling { .. } | Error::RecoveryExhausted { .. }
        )
    }
}
