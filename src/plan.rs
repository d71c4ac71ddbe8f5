//! Project plans: a task list plus an optional worker roster.
//!
//! Plans are read from TOML or JSON, picked by file extension:
//!
//! ```toml
//! name = "login"
//!
//! [[tasks]]
//! id = "form"
//! title = "Build login form"
//! required_skills = ["react"]
//!
//! [[tasks]]
//! id = "api"
//! title = "Add session endpoint"
//! dependencies = ["form"]
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::config::EngineConfig;
use crate::core::builder::{BuiltGraph, GraphBuilder};
use crate::core::task::TaskSpec;
use crate::error::{Error, Result};
use crate::orchestration::matcher::WorkerProfile;
use crate::orchestration::pool::WorkerPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPlan {
    #[serde(default)]
    pub name: Option<String>,
    pub tasks: Vec<TaskSpec>,
    /// Empty means the default roster.
    #[serde(default)]
    pub workers: Vec<WorkerProfile>,
}

impl ProjectPlan {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: None,
            tasks,
            workers: Vec::new(),
        }
    }

    pub fn with_workers(mut self, workers: Vec<WorkerProfile>) -> Self {
        self.workers = workers;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a plan, choosing the format from the extension (`.json` or
    /// `.toml`).
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let plan = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            Some("toml") => Self::from_toml_str(&text)?,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported plan format {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };
        debug!(
            path = %path.display(),
            tasks = plan.tasks.len(),
            workers = plan.workers.len(),
            "plan loaded"
        );
        Ok(plan)
    }

    pub fn build(&self, config: &EngineConfig) -> Result<BuiltGraph> {
        GraphBuilder::new(config).build(&self.tasks)
    }

    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.workers.clone())
    }
}
