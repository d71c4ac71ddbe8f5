//! Durable checkpoint tests against the file store.

use std::sync::Arc;
use tempfile::TempDir;

use cadence::core::{GraphStatus, NodeStatus};
use cadence::state::checkpoint::{EXECUTION_START, INITIALIZED};
use cadence::state::{FileStore, PersistenceStore, ProjectId};

use crate::fixtures::{chain_abc, fast_config, login_form, Harness, MockExecutor};

fn persisted(project: &str, root: &TempDir, executor: Arc<MockExecutor>) -> Harness {
    let mut harness = Harness::new(project, &login_form(), fast_config(), executor);
    harness.scheduler = harness
        .scheduler
        .with_persistence(Arc::new(FileStore::new(root.path())));
    harness
}

/// Given a scheduler backed by a file store
/// When the project runs to completion
/// Then its named and automatic checkpoints are on disk with the final status
#[tokio::test]
async fn test_run_persists_checkpoints() {
    let root = TempDir::new().unwrap();
    let mut harness = persisted("stored", &root, MockExecutor::passing());
    harness.scheduler.run().await.unwrap();

    let store = FileStore::new(root.path());
    let projects = store.list_projects().await.unwrap();
    assert_eq!(projects.len(), 1);

    let summary = &projects[0];
    assert_eq!(summary.id, ProjectId::from("stored"));
    assert_eq!(summary.status, Some(GraphStatus::Completed));
    assert!(summary.checkpoints.contains(&INITIALIZED.to_string()));
    assert!(summary.checkpoints.contains(&EXECUTION_START.to_string()));
    assert!(summary.checkpoints.iter().any(|n| n.starts_with("auto-")));
    assert!(root.path().join("stored").join("initialized.json").exists());
}

/// Given checkpoints written by an earlier process
/// When a new scheduler adopts execution_start from disk
/// Then it resumes from there and completes with its own executor
#[tokio::test]
async fn test_resume_from_disk_in_new_scheduler() {
    let root = TempDir::new().unwrap();
    let mut first = persisted("resume", &root, MockExecutor::passing());
    first.scheduler.run().await.unwrap();
    drop(first);

    let store = FileStore::new(root.path());
    let checkpoint = store
        .load_checkpoint(&ProjectId::from("resume"), EXECUTION_START)
        .await
        .unwrap();
    assert_eq!(checkpoint.graph.status, GraphStatus::Executing);
    assert!(checkpoint
        .nodes
        .values()
        .all(|s| s.status == NodeStatus::Pending));

    let executor = MockExecutor::passing();
    let mut second = persisted("resume", &root, executor.clone());
    second.scheduler.adopt(checkpoint).unwrap();
    let report = second.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(executor.call_count(), 5);
}

/// Given a checkpoint from a different plan
/// When a scheduler tries to adopt it
/// Then validation rejects it before any state changes
#[tokio::test]
async fn test_foreign_checkpoint_rejected() {
    let root = TempDir::new().unwrap();
    let mut first = persisted("login", &root, MockExecutor::passing());
    first.scheduler.run().await.unwrap();

    let checkpoint = FileStore::new(root.path())
        .load_checkpoint(&ProjectId::from("login"), EXECUTION_START)
        .await
        .unwrap();

    let mut other = Harness::new("chain", &chain_abc(), fast_config(), MockExecutor::passing());
    assert!(other.scheduler.adopt(checkpoint).is_err());
    assert_eq!(other.scheduler.state().status, GraphStatus::Initialized);
}

#[tokio::test]
async fn test_delete_project_removes_files() {
    let root = TempDir::new().unwrap();
    let mut harness = persisted("gone", &root, MockExecutor::passing());
    harness.scheduler.run().await.unwrap();

    let store = FileStore::new(root.path());
    store.delete_project(&ProjectId::from("gone")).await.unwrap();
    assert!(store.list_projects().await.unwrap().is_empty());
    assert!(store
        .load_checkpoint(&ProjectId::from("gone"), INITIALIZED)
        .await
        .is_err());
}
