//! Durable storage for checkpoints.
//!
//! The engine only talks to the [`PersistenceStore`] trait. Every call is
//! atomic: a failed save leaves the previous version of that checkpoint in
//! place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::graph::GraphStatus;
use crate::error::{Error, Result};
use crate::state::checkpoint::Checkpoint;

/// Identifier of a project (one graph run).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub checkpoints: Vec<String>,
    pub latest_version: u64,
    pub status: Option<GraphStatus>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectSummary {
    fn from_checkpoints<'a>(
        id: ProjectId,
        checkpoints: impl IntoIterator<Item = &'a Checkpoint>,
    ) -> Self {
        let mut names = Vec::new();
        let mut latest: Option<&Checkpoint> = None;
        for checkpoint in checkpoints {
            names.push(checkpoint.name.clone());
            if latest.map_or(true, |l| checkpoint.version > l.version) {
                latest = Some(checkpoint);
            }
        }
        names.sort();
        Self {
            id,
            checkpoints: names,
            latest_version: latest.map(|c| c.version).unwrap_or(0),
            status: latest.map(|c| c.graph.status),
            updated_at: latest.map(|c| c.created_at),
        }
    }
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_checkpoint(
        &self,
        project: &ProjectId,
        name: &str,
        checkpoint: &Checkpoint,
    ) -> Result<()>;

    async fn load_checkpoint(&self, project: &ProjectId, name: &str) -> Result<Checkpoint>;

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>>;

    async fn delete_project(&self, project: &ProjectId) -> Result<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    projects: RwLock<HashMap<ProjectId, BTreeMap<String, Checkpoint>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_checkpoint(
        &self,
        project: &ProjectId,
        name: &str,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        self.projects
            .write()
            .await
            .entry(project.clone())
            .or_default()
            .insert(name.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, project: &ProjectId, name: &str) -> Result<Checkpoint> {
        self.projects
            .read()
            .await
            .get(project)
            .and_then(|c| c.get(name))
            .cloned()
            .ok_or_else(|| Error::Persistence(format!("no checkpoint {} for {}", name, project)))
    }

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let projects = self.projects.read().await;
        let mut summaries: Vec<ProjectSummary> = projects
            .iter()
            .map(|(id, checkpoints)| ProjectSummary::from_checkpoints(id.clone(), checkpoints.values()))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete_project(&self, project: &ProjectId) -> Result<()> {
        self.projects
            .write()
            .await
            .remove(project)
            .map(|_| ())
            .ok_or_else(|| Error::Persistence(format!("unknown project {}", project)))
    }
}

/// One JSON file per checkpoint under `<root>/<project>/<name>.json`.
///
/// Saves write a temporary file and rename it over the target.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

fn safe_component(value: &str) -> Result<&str> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(value)
    } else {
        Err(Error::Persistence(format!("invalid storage name {:?}", value)))
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project: &ProjectId) -> Result<PathBuf> {
        Ok(self.root.join(safe_component(project.as_str())?))
    }

    fn checkpoint_path(&self, project: &ProjectId, name: &str) -> Result<PathBuf> {
        Ok(self
            .project_dir(project)?
            .join(format!("{}.json", safe_component(name)?)))
    }

    async fn read_project(&self, dir: &Path) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn save_checkpoint(
        &self,
        project: &ProjectId,
        name: &str,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let path = self.checkpoint_path(project, name)?;
        let dir = self.project_dir(project)?;
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.json.tmp", safe_component(name)?));
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(project = %project, name, path = %path.display(), "checkpoint persisted");
        Ok(())
    }

    async fn load_checkpoint(&self, project: &ProjectId, name: &str) -> Result<Checkpoint> {
        let path = self.checkpoint_path(project, name)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            Error::Persistence(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = ProjectId::from(entry.file_name().to_string_lossy().into_owned());
            let checkpoints = self.read_project(&entry.path()).await?;
            summaries.push(ProjectSummary::from_checkpoints(id, checkpoints.iter()));
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete_project(&self, project: &ProjectId) -> Result<()> {
        let dir = self.project_dir(project)?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| Error::Persistence(format!("cannot delete {}: {}", project, e)))
    }
}
