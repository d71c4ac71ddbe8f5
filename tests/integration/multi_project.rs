//! Several projects running side by side.

use std::collections::BTreeSet;
use std::sync::Arc;

use cadence::core::{GraphStatus, TaskSpec};
use cadence::orchestration::{EventBus, ExecutionOutcome, MemorySink, PauseMode};
use cadence::plan::ProjectPlan;
use cadence::registry::ProjectRegistry;
use cadence::state::{InMemoryStore, PersistenceStore, ProjectId};

use crate::fixtures::{fast_config, MockExecutor};

fn registry(
    executor: Arc<MockExecutor>,
    store: Arc<InMemoryStore>,
) -> (ProjectRegistry, EventBus, Arc<MemorySink>) {
    cadence::log::init_for_tests();
    let sink = Arc::new(MemorySink::new());
    let bus = EventBus::new(sink.clone(), 16_384);
    let registry = ProjectRegistry::new(fast_config(), executor, store, bus.publisher());
    (registry, bus, sink)
}

fn web_plan() -> ProjectPlan {
    ProjectPlan::new(vec![
        TaskSpec::new("schema", "Design schema"),
        TaskSpec::new("api", "Build API").with_dependencies(&["schema"]),
    ])
}

fn docs_plan() -> ProjectPlan {
    ProjectPlan::new(vec![TaskSpec::new("guide", "Write user guide")])
}

/// Given two projects started on one registry
/// When both run concurrently
/// Then each completes its own graph and both are persisted
#[tokio::test(start_paused = true)]
async fn test_projects_run_concurrently() {
    let executor = MockExecutor::passing();
    let store = Arc::new(InMemoryStore::new());
    let (mut registry, bus, sink) = registry(executor.clone(), store.clone());

    let web = registry.start_as(ProjectId::from("web"), &web_plan()).unwrap();
    let docs = registry.start_as(ProjectId::from("docs"), &docs_plan()).unwrap();
    let (web_status, docs_status) = tokio::join!(registry.wait(&web), registry.wait(&docs));

    let web_status = web_status.unwrap();
    let docs_status = docs_status.unwrap();
    assert_eq!(web_status.report.status, GraphStatus::Completed);
    assert_eq!(web_status.report.completed, 8);
    assert_eq!(docs_status.report.status, GraphStatus::Completed);
    assert_eq!(docs_status.report.completed, 5);
    assert_eq!(executor.call_count(), 13);

    let stored: Vec<ProjectId> = store
        .list_projects()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(stored, vec![docs.clone(), web.clone()]);

    drop(registry);
    bus.shutdown();
    let projects: BTreeSet<String> = sink
        .events()
        .into_iter()
        .filter(|(kind, _)| kind == "execution_finished")
        .filter_map(|(_, payload)| payload["project"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        projects,
        BTreeSet::from(["docs".to_string(), "web".to_string()])
    );
}

/// Given one project whose build always fails
/// When it runs next to a healthy project
/// Then only the broken project fails
#[tokio::test(start_paused = true)]
async fn test_failure_is_isolated() {
    let executor = MockExecutor::new(|id, _| {
        if id.as_str() == "guide" {
            ExecutionOutcome::failure("build failed: missing toolchain", 20)
        } else {
            ExecutionOutcome::success("quality_score: 0.9", 20)
        }
    });
    let (mut registry, _bus, _sink) = registry(executor, Arc::new(InMemoryStore::new()));

    let web = registry.start_as(ProjectId::from("web"), &web_plan()).unwrap();
    let docs = registry.start_as(ProjectId::from("docs"), &docs_plan()).unwrap();

    let docs_status = registry.wait(&docs).await.unwrap();
    let web_status = registry.wait(&web).await.unwrap();
    assert_eq!(docs_status.report.status, GraphStatus::Failed);
    assert_eq!(web_status.report.status, GraphStatus::Completed);
}

/// Given a running project
/// When it is paused with terminate and deleted
/// Then the other project keeps going and the deleted one is gone
#[tokio::test(start_paused = true)]
async fn test_delete_one_keeps_other() {
    let executor = MockExecutor::passing();
    let store = Arc::new(InMemoryStore::new());
    let (mut registry, _bus, _sink) = registry(executor, store.clone());

    let web = registry.start_as(ProjectId::from("web"), &web_plan()).unwrap();
    let docs = registry.start_as(ProjectId::from("docs"), &docs_plan()).unwrap();
    registry.pause(&web, PauseMode::Terminate).unwrap();
    registry.delete(&web).await.unwrap();

    let docs_status = registry.wait(&docs).await.unwrap();
    assert_eq!(docs_status.report.status, GraphStatus::Completed);
    assert!(registry.status(&web).is_err());
    let listed: Vec<ProjectId> = registry.list().into_iter().map(|(id, _)| id).collect();
    assert_eq!(listed, vec![docs]);
}
