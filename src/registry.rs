//! Project registry.
//!
//! Each project owns a [`Scheduler`] driven on its own tokio task; projects
//! share nothing but the executor, the persistence store and the event
//! publisher. The registry only talks to a project through its
//! [`SchedulerControl`] and a status channel.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::graph::GraphStatus;
use crate::error::{Error, Result};
use crate::orchestration::events::EventPublisher;
use crate::orchestration::executor::TaskExecutor;
use crate::orchestration::scheduler::{PauseMode, RunReport, Scheduler, SchedulerControl};
use crate::plan::ProjectPlan;
use crate::state::persistence::{PersistenceStore, ProjectId, ProjectSummary};

/// Last known state of a registered project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    /// A run pass is in progress.
    pub running: bool,
    pub report: RunReport,
    /// Fatal error of the last pass, if any.
    pub error: Option<String>,
}

impl ProjectStatus {
    /// Nothing more will happen without outside action.
    pub fn is_settled(&self) -> bool {
        !self.running
    }
}

struct ProjectHandle {
    control: SchedulerControl,
    status: Arc<watch::Sender<ProjectStatus>>,
    task: JoinHandle<()>,
}

pub struct ProjectRegistry {
    config: EngineConfig,
    executor: Arc<dyn TaskExecutor>,
    store: Arc<dyn PersistenceStore>,
    events: EventPublisher,
    working_dir: PathBuf,
    projects: BTreeMap<ProjectId, ProjectHandle>,
}

impl ProjectRegistry {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn PersistenceStore>,
        events: EventPublisher,
    ) -> Self {
        Self {
            config,
            executor,
            store,
            events,
            working_dir: PathBuf::from("."),
            projects: BTreeMap::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Build the plan's graph and start running it under a fresh id.
    pub fn start(&mut self, plan: &ProjectPlan) -> Result<ProjectId> {
        self.start_as(ProjectId::new(), plan)
    }

    /// Start a project under a caller-chosen id.
    ///
    /// # Errors
    /// `Validation` if the id is already registered, otherwise whatever graph
    /// construction or scheduler setup reports.
    pub fn start_as(&mut self, id: ProjectId, plan: &ProjectPlan) -> Result<ProjectId> {
        if self.projects.contains_key(&id) {
            return Err(Error::Validation(format!("project {} already registered", id)));
        }
        let built = plan.build(&self.config)?;
        let scheduler = Scheduler::new(
            id.clone(),
            built,
            self.config.clone(),
            plan.pool(),
            Arc::clone(&self.executor),
            self.events.clone(),
        )?
        .with_persistence(Arc::clone(&self.store))
        .with_working_dir(self.working_dir.clone());

        let control = scheduler.control();
        let (tx, _) = watch::channel(ProjectStatus {
            running: true,
            report: scheduler.report(),
            error: None,
        });
        let status = Arc::new(tx);
        let task = tokio::spawn(drive(scheduler, Arc::clone(&status)));

        info!(project = %id, tasks = plan.tasks.len(), "project started");
        self.projects.insert(
            id.clone(),
            ProjectHandle {
                control,
                status,
                task,
            },
        );
        Ok(id)
    }

    fn handle(&self, id: &ProjectId) -> Result<&ProjectHandle> {
        self.projects
            .get(id)
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    pub fn pause(&self, id: &ProjectId, mode: PauseMode) -> Result<()> {
        let handle = self.handle(id)?;
        handle.control.pause(mode);
        info!(project = %id, ?mode, "pause requested");
        Ok(())
    }

    pub fn resume(&self, id: &ProjectId) -> Result<()> {
        let handle = self.handle(id)?;
        if handle.status.borrow().report.status == GraphStatus::Paused {
            handle.status.send_modify(|s| s.running = true);
        }
        handle.control.resume();
        info!(project = %id, "resume requested");
        Ok(())
    }

    pub fn status(&self, id: &ProjectId) -> Result<ProjectStatus> {
        Ok(self.handle(id)?.status.borrow().clone())
    }

    /// Wait until the project's current run pass returns (completed, failed
    /// or paused).
    pub async fn wait(&self, id: &ProjectId) -> Result<ProjectStatus> {
        let mut rx = self.handle(id)?.status.subscribe();
        let status = rx
            .wait_for(ProjectStatus::is_settled)
            .await
            .map_err(|_| Error::ProjectNotFound(id.to_string()))?
            .clone();
        Ok(status)
    }

    /// Registered projects and their last known status.
    pub fn list(&self) -> Vec<(ProjectId, ProjectStatus)> {
        self.projects
            .iter()
            .map(|(id, h)| (id.clone(), h.status.borrow().clone()))
            .collect()
    }

    /// Projects known to the persistence store, including ones from earlier
    /// processes.
    pub async fn stored(&self) -> Result<Vec<ProjectSummary>> {
        self.store.list_projects().await
    }

    /// Stop a project, drop it from the registry and delete its checkpoints.
    pub async fn delete(&mut self, id: &ProjectId) -> Result<()> {
        if let Some(handle) = self.projects.remove(id) {
            handle.control.pause(PauseMode::Terminate);
            let mut rx = handle.status.subscribe();
            if rx.wait_for(ProjectStatus::is_settled).await.is_err() {
                warn!(project = %id, "project task ended without settling");
            }
            handle.task.abort();
        }
        self.store.delete_project(id).await?;
        info!(project = %id, "project deleted");
        Ok(())
    }
}

impl Drop for ProjectRegistry {
    fn drop(&mut self) {
        for handle in self.projects.values() {
            handle.control.pause(PauseMode::Terminate);
        }
    }
}

/// Run passes until the graph settles, waiting for a resume after each
/// pause.
async fn drive(mut scheduler: Scheduler, status: Arc<watch::Sender<ProjectStatus>>) {
    let control = scheduler.control();
    loop {
        status.send_modify(|s| s.running = true);
        let error = match scheduler.run().await {
            Ok(_) => None,
            Err(e) => {
                warn!(project = %scheduler.project(), error = %e, "run ended with error");
                Some(e.to_string())
            }
        };
        let report = scheduler.report();
        let paused = report.status == GraphStatus::Paused;
        status.send_replace(ProjectStatus {
            running: false,
            report,
            error,
        });
        if !paused {
            return;
        }
        control.resumed().await;
    }
}
