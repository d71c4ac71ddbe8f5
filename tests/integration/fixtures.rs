//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor that records every dispatch
//! - Building a scheduler wired to an in-memory event sink
//! - Predefined task sets

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use cadence::config::{BackoffConfig, EngineConfig};
use cadence::core::{GraphBuilder, NodeId, TaskSpec};
use cadence::orchestration::{
    EventBus, ExecutionOutcome, ExecutionRequest, MemorySink, Scheduler, TaskExecutor, WorkerPool,
};
use cadence::state::ProjectId;
use cadence::Result;

type Respond = dyn Fn(&NodeId, usize) -> ExecutionOutcome + Send + Sync;

/// Executor answering from a closure of (node, earlier calls for that node).
///
/// Every call sleeps for `latency` so concurrent dispatches overlap.
pub struct MockExecutor {
    respond: Box<Respond>,
    latency: Duration,
    calls: Mutex<Vec<(NodeId, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExecutor {
    pub fn new(
        respond: impl Fn(&NodeId, usize) -> ExecutionOutcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            latency: Duration::from_millis(20),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Every node passes with a 0.9 score.
    pub fn passing() -> Arc<Self> {
        Self::new(|_, _| ExecutionOutcome::success("All tests passed\nquality_score: 0.9", 20))
    }

    /// Nodes in `node` fail with `output` for their first `times` calls.
    pub fn failing_first(node: &str, times: usize, output: &'static str) -> Arc<Self> {
        let node = NodeId::from(node);
        Self::new(move |id, previous| {
            if *id == node && previous < times {
                ExecutionOutcome::failure(output, 20)
            } else {
                ExecutionOutcome::success("quality_score: 0.9", 20)
            }
        })
    }

    /// Node ids in dispatch order.
    pub fn order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect()
    }

    pub fn prompts(&self, node: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == node)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of simultaneous calls seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|(id, _)| *id == request.node_id).count();
            calls.push((request.node_id.clone(), request.prompt.clone()));
            previous
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.latency) => {}
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok((self.respond)(&request.node_id, previous))
    }
}

/// Engine config with short waits, suitable for paused-clock tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 50,
        backoff: BackoffConfig {
            base_ms: 10,
            max_ms: 100,
        },
        ..EngineConfig::default()
    }
}

/// A scheduler plus the bus and sink receiving its events.
pub struct Harness {
    pub scheduler: Scheduler,
    pub sink: Arc<MemorySink>,
    pub bus: EventBus,
}

impl Harness {
    pub fn new(
        project: &str,
        tasks: &[TaskSpec],
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        cadence::log::init_for_tests();
        let built = GraphBuilder::new(&config)
            .build(tasks)
            .expect("plan should build");
        let sink = Arc::new(MemorySink::new());
        let bus = EventBus::new(sink.clone(), 16_384);
        let scheduler = Scheduler::new(
            ProjectId::from(project),
            built,
            config,
            WorkerPool::new(Vec::new()),
            executor,
            bus.publisher(),
        )
        .expect("scheduler should start");
        Self {
            scheduler,
            sink,
            bus,
        }
    }

    /// Drop the scheduler, drain the bus and return the collected events.
    pub fn finish(self) -> Arc<MemorySink> {
        let Harness {
            scheduler,
            sink,
            bus,
        } = self;
        drop(scheduler);
        bus.shutdown();
        sink
    }
}

// ---- task sets

/// The single-task project from the README: one task, five nodes.
pub fn login_form() -> Vec<TaskSpec> {
    vec![TaskSpec::new("login", "Build login form")
        .with_description("Email and password fields with client-side validation")
        .with_skills(&["react", "typescript"])]
}

/// A -> B -> C.
pub fn chain_abc() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("a", "Create schema"),
        TaskSpec::new("b", "Build API").with_dependencies(&["a"]),
        TaskSpec::new("c", "Build UI").with_dependencies(&["b"]),
    ]
}

/// `n` independent tasks.
pub fn fan_out(n: usize) -> Vec<TaskSpec> {
    (0..n)
        .map(|i| TaskSpec::new(&format!("t{}", i), &format!("Implement feature {}", i)))
        .collect()
}
