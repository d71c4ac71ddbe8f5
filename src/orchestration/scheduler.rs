//! Scheduler for one project graph.
//!
//! The `Scheduler` is the single writer of the graph state, the per-node
//! state map and the memory bank. Each ready node is dispatched on its own
//! tokio task; the task reports back over an mpsc channel and the run loop
//! applies every state change itself.
//!
//! Completions carry the epoch they were dispatched in. Recovery bumps the
//! epoch, so results of dispatches that were running before a restore are
//! discarded.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conditions::{EdgeEvaluator, EvaluationContext, EvaluationReason, SourceResult};
use crate::config::EngineConfig;
use crate::core::builder::{BuiltGraph, CheckpointPair};
use crate::core::graph::{EdgeId, GraphState, GraphStatus, TaskGraph};
use crate::core::task::{NodeId, NodeState, NodeStatus, TaskNode};
use crate::error::{Error, Result};
use crate::orchestration::events::{EngineEvent, EventPublisher};
use crate::orchestration::executor::{
    millis, ExecutionOutcome, ExecutionRequest, TaskExecutor, TimeoutPolicy,
};
use crate::orchestration::matcher::{Assignment, CapabilityMatcher};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::prompt::{self, Followup};
use crate::orchestration::remediation::{RemediationAction, RemediationPolicy, RetryBackoff, Severity};
use crate::orchestration::verifier::{OutputVerifier, QualityReport, QualityVerifier};
use crate::state::checkpoint::{Checkpoint, CheckpointStore, EXECUTION_START, INITIALIZED};
use crate::state::memory::{ExecutionRecord, MemoryBank, WorkerStats, REMEDIATION_PLANS};
use crate::state::persistence::{PersistenceStore, ProjectId};
use crate::state::recovery::{self, LiveState};

/// How a pause treats dispatches that are still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    /// Stop dispatching and let in-flight calls finish.
    Drain,
    /// Stop dispatching and cancel in-flight calls; their nodes go back to
    /// `pending` without spending a retry.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    Pause(PauseMode),
}

/// Handle for pausing and resuming a scheduler from another task.
///
/// A pause makes [`Scheduler::run`] return once nothing is in flight, with
/// the graph in `paused`. Call [`SchedulerControl::resume`] and then `run`
/// again to continue.
#[derive(Debug, Clone)]
pub struct SchedulerControl {
    tx: Arc<watch::Sender<Signal>>,
}

impl SchedulerControl {
    fn new() -> Self {
        let (tx, _) = watch::channel(Signal::Run);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self, mode: PauseMode) {
        self.tx.send_replace(Signal::Pause(mode));
    }

    pub fn resume(&self) {
        self.tx.send_replace(Signal::Run);
    }

    pub fn pause_requested(&self) -> Option<PauseMode> {
        match *self.tx.borrow() {
            Signal::Pause(mode) => Some(mode),
            Signal::Run => None,
        }
    }

    /// Wait until no pause is requested.
    pub async fn resumed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|signal| *signal == Signal::Run).await;
    }

    fn subscribe(&self) -> watch::Receiver<Signal> {
        self.tx.subscribe()
    }
}

/// Summary of a run, suitable for printing as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project: ProjectId,
    pub status: GraphStatus,
    pub progress: f64,
    pub completed: usize,
    pub total: usize,
    pub error_count: u32,
    pub retry_count: u32,
    pub dropped_events: u64,
    pub nodes: BTreeMap<NodeId, NodeStatus>,
    pub warnings: BTreeMap<NodeId, String>,
    pub workers: BTreeMap<String, WorkerStats>,
}

/// Extra instructions waiting for a node's next dispatch.
#[derive(Debug, Clone)]
enum PendingFollowup {
    Retry { attempt: u32, error: String },
    Rework { attempt: u32, plan: String },
}

impl PendingFollowup {
    fn as_followup(&self) -> Followup<'_> {
        match self {
            PendingFollowup::Retry { attempt, error } => Followup::Retry {
                attempt: *attempt,
                previous_error: error,
            },
            PendingFollowup::Rework { attempt, plan } => Followup::Rework {
                attempt: *attempt,
                plan,
            },
        }
    }
}

#[derive(Debug)]
enum DispatchResult {
    Finished(ExecutionOutcome),
    Errored(String),
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug)]
struct NodeCompletion {
    node: NodeId,
    epoch: u64,
    elapsed_ms: u64,
    result: DispatchResult,
}

struct Requeue {
    attempt: u32,
    followup: PendingFollowup,
    delay: Option<Duration>,
    label: &'static str,
}

fn excerpt(text: &str) -> String {
    text.chars().take(500).collect()
}

/// Drives one project graph to completion.
pub struct Scheduler {
    project: ProjectId,
    config: EngineConfig,
    graph: TaskGraph,
    /// Node ids in dependency order, ignoring cyclical edges.
    order: Vec<NodeId>,
    checkpoint_pairs: BTreeMap<NodeId, CheckpointPair>,
    nodes: BTreeMap<NodeId, NodeState>,
    state: GraphState,
    memory: MemoryBank,
    checkpoints: CheckpointStore,
    /// Latest result per node, consumed by edge conditions.
    results: HashMap<NodeId, SourceResult>,
    followups: HashMap<NodeId, PendingFollowup>,
    /// Earliest dispatch time for nodes waiting out a retry backoff.
    not_before: HashMap<NodeId, Instant>,
    pool: WorkerPool,
    matcher: CapabilityMatcher,
    evaluator: EdgeEvaluator,
    policy: RemediationPolicy,
    timeouts: TimeoutPolicy,
    verifier: Arc<dyn QualityVerifier>,
    executor: Arc<dyn TaskExecutor>,
    store: Option<Arc<dyn PersistenceStore>>,
    events: EventPublisher,
    control: SchedulerControl,
    cancel: CancellationToken,
    epoch: u64,
    completions_since_snapshot: u32,
    working_dir: PathBuf,
}

impl Scheduler {
    /// Create a scheduler for a built graph and take the `initialized`
    /// checkpoint.
    ///
    /// # Errors
    /// `Validation` for an unusable config, `GraphConstruction` if the graph
    /// has an unflagged cycle.
    pub fn new(
        project: ProjectId,
        built: BuiltGraph,
        config: EngineConfig,
        pool: WorkerPool,
        executor: Arc<dyn TaskExecutor>,
        events: EventPublisher,
    ) -> Result<Self> {
        config.validate()?;
        let BuiltGraph {
            graph,
            checkpoints: checkpoint_pairs,
            ..
        } = built;
        let order = graph.topological_order()?;
        let nodes = graph
            .nodes()
            .map(|n| (n.id.clone(), NodeState::default()))
            .collect();

        let mut scheduler = Self {
            project,
            state: GraphState::new(graph.node_count(), config.max_parallelism),
            checkpoints: CheckpointStore::new(config.checkpoint_retention),
            evaluator: EdgeEvaluator::new(
                config.quality_threshold,
                config.general_sub_iterations,
                config.warnings_pass_quality_gates,
            ),
            policy: RemediationPolicy::new(
                config.severity.clone(),
                RetryBackoff::from_config(&config.backoff),
            ),
            timeouts: TimeoutPolicy::from_config(&config.timeouts),
            config,
            graph,
            order,
            checkpoint_pairs,
            nodes,
            memory: MemoryBank::new(),
            results: HashMap::new(),
            followups: HashMap::new(),
            not_before: HashMap::new(),
            pool,
            matcher: CapabilityMatcher::new(),
            verifier: Arc::new(OutputVerifier::new()),
            executor,
            store: None,
            events,
            control: SchedulerControl::new(),
            cancel: CancellationToken::new(),
            epoch: 0,
            completions_since_snapshot: 0,
            working_dir: PathBuf::from("."),
        };
        scheduler.take_checkpoint(Some(INITIALIZED));
        Ok(scheduler)
    }

    /// Persist every checkpoint to `store` as it is taken.
    pub fn with_persistence(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn QualityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, NodeState> {
        &self.nodes
    }

    pub fn node_state(&self, id: &NodeId) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn memory(&self) -> &MemoryBank {
        &self.memory
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            project: self.project.clone(),
            status: self.state.status,
            progress: self.state.progress,
            completed: self.state.completed_nodes.len(),
            total: self.state.total_nodes,
            error_count: self.state.error_count,
            retry_count: self.state.retry_count,
            dropped_events: self.events.dropped(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, s)| (id.clone(), s.status))
                .collect(),
            warnings: self
                .nodes
                .iter()
                .filter_map(|(id, s)| s.warning.clone().map(|w| (id.clone(), w)))
                .collect(),
            workers: self
                .pool
                .workers()
                .iter()
                .map(|w| (w.id.clone(), self.memory.worker_stats(&w.id)))
                .collect(),
        }
    }

    // ---- events and checkpoints

    fn emit(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    fn node_changed(&self, node: &NodeId, from: NodeStatus, to: NodeStatus) {
        debug!(project = %self.project, node = %node, %from, %to, "node status");
        self.emit(EngineEvent::NodeStatusChanged {
            project: self.project.clone(),
            node: node.clone(),
            from,
            to,
        });
    }

    fn set_graph_status(&mut self, to: GraphStatus) -> Result<()> {
        let from = self.state.status;
        self.state.transition(to)?;
        info!(project = %self.project, %from, %to, "graph status");
        self.emit(EngineEvent::GraphStatusChanged {
            project: self.project.clone(),
            from,
            to,
        });
        Ok(())
    }

    fn take_checkpoint(&mut self, name: Option<&str>) -> Checkpoint {
        let checkpoint = match name {
            Some(name) => self
                .checkpoints
                .create(name, &self.state, &self.nodes, &self.memory),
            None => self
                .checkpoints
                .create_automatic(&self.state, &self.nodes, &self.memory),
        };
        self.emit(EngineEvent::CheckpointCreated {
            project: self.project.clone(),
            name: checkpoint.name.clone(),
            version: checkpoint.version,
        });
        checkpoint
    }

    async fn persist(&self, checkpoint: &Checkpoint) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store
            .save_checkpoint(&self.project, &checkpoint.name, checkpoint)
            .await
        {
            warn!(project = %self.project, name = %checkpoint.name, error = %e, "failed to persist checkpoint");
        }
    }

    /// Take and persist a named checkpoint of the live state.
    pub async fn create_checkpoint(&mut self, name: &str) -> Checkpoint {
        let checkpoint = self.take_checkpoint(Some(name));
        self.persist(&checkpoint).await;
        checkpoint
    }

    async fn snapshot(&mut self) {
        let checkpoint = self.take_checkpoint(None);
        self.persist(&checkpoint).await;
        self.completions_since_snapshot = 0;
    }

    /// Restore a checkpoint by name.
    ///
    /// Nodes that were `running` in the snapshot come back as `pending`.
    pub fn restore_checkpoint(&mut self, name: &str) -> Result<()> {
        self.reclaim_orphans();
        let node_ids = self.graph.node_ids();
        let restored = self.checkpoints.restore(name, &node_ids, &self.memory)?;
        self.state = restored.graph;
        self.nodes = restored.nodes;
        self.memory = restored.memory;
        self.reclaim_orphans();
        self.emit(EngineEvent::CheckpointRestored {
            project: self.project.clone(),
            name: restored.name,
            version: restored.version,
        });
        Ok(())
    }

    /// Adopt a checkpoint loaded from persistence and restore it.
    pub fn adopt(&mut self, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.validate(&self.graph.node_ids())?;
        let name = checkpoint.name.clone();
        self.checkpoints.insert(checkpoint);
        self.restore_checkpoint(&name)
    }

    /// Move a `failed` graph back to `executing`, resetting failed and
    /// blocked nodes with a fresh retry budget. Returns how many were reset.
    pub fn retry_failed(&mut self) -> Result<usize> {
        if self.state.status != GraphStatus::Failed {
            return Err(Error::InvalidTransition {
                from: self.state.status.to_string(),
                to: "retry".to_string(),
            });
        }
        self.set_graph_status(GraphStatus::Executing)?;
        let stuck: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, s)| matches!(s.status, NodeStatus::Failed | NodeStatus::Blocked))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stuck {
            let Some(state) = self.nodes.get_mut(id) else {
                continue;
            };
            let from = state.status;
            state.reset(true);
            state.retry_count = 0;
            self.state.mark_pending(id);
            self.node_changed(id, from, NodeStatus::Pending);
        }
        info!(project = %self.project, reset = stuck.len(), "retrying failed graph");
        Ok(stuck.len())
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut NodeState> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::NodeNotFound(id.clone()))
    }

    /// Put nodes left `running` by an abandoned run back to `pending`.
    fn reclaim_orphans(&mut self) {
        let running: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        if running.is_empty() && self.pool.total_in_flight() == 0 {
            return;
        }
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch += 1;
        self.pool.release_all();
        for id in &running {
            if let Some(state) = self.nodes.get_mut(id) {
                state.reset(false);
            }
            self.state.mark_pending(id);
            self.node_changed(id, NodeStatus::Running, NodeStatus::Pending);
        }
        self.state.current_nodes.clear();
    }

    // ---- run loop

    /// Run until the graph completes, fails or is paused.
    ///
    /// # Errors
    /// `Scheduling` when the loop ceiling is exceeded and `RecoveryExhausted`
    /// when no recovery strategy produced a usable state. The graph is
    /// `failed` in both cases.
    pub async fn run(&mut self) -> Result<RunReport> {
        match self.state.status {
            GraphStatus::Completed | GraphStatus::Failed => return Ok(self.report()),
            GraphStatus::Initialized => {
                if let Some(initial) = self.checkpoints.get(INITIALIZED).cloned() {
                    self.persist(&initial).await;
                }
                self.set_graph_status(GraphStatus::Executing)?;
                self.create_checkpoint(EXECUTION_START).await;
            }
            GraphStatus::Paused => self.set_graph_status(GraphStatus::Executing)?,
            GraphStatus::Executing => {}
        }
        self.reclaim_orphans();
        self.cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::channel::<NodeCompletion>(self.config.max_parallelism.max(1) * 2);
        let mut control = self.control.subscribe();
        let mut steps: u64 = 0;

        while !self.state.status.is_terminal() {
            if let Err(e) = self.state.check_invariants(&self.nodes) {
                self.step(&mut steps)?;
                self.recover(e).await?;
                continue;
            }

            let signal = *control.borrow_and_update();
            if let Signal::Pause(mode) = signal {
                if mode == PauseMode::Terminate {
                    self.cancel.cancel();
                }
                if self.pool.total_in_flight() == 0 {
                    self.pause(mode).await?;
                    return Ok(self.report());
                }
            } else {
                match self.dispatch_ready(&tx) {
                    Ok(0) if self.pool.total_in_flight() == 0 && !self.has_delayed() => {
                        self.settle().await?;
                        continue;
                    }
                    Ok(0) => {}
                    Ok(_) => self.step(&mut steps)?,
                    Err(e) => {
                        self.step(&mut steps)?;
                        self.recover(e).await?;
                        continue;
                    }
                }
            }

            let wait = self.next_wait();
            let completion = tokio::select! {
                done = rx.recv() => done,
                _ = control.changed() => None,
                _ = tokio::time::sleep(wait) => None,
            };
            if let Some(done) = completion {
                self.step(&mut steps)?;
                if let Err(e) = self.handle_completion(done).await {
                    self.recover(e).await?;
                }
            }
        }

        Ok(self.report())
    }

    /// Count a pass that changed state against the loop ceiling. Idle
    /// wakeups while work is in flight never reach here.
    fn step(&mut self, steps: &mut u64) -> Result<()> {
        *steps += 1;
        if *steps > self.config.max_loop_iterations {
            let err = Error::Scheduling {
                iterations: self.config.max_loop_iterations,
            };
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    fn has_delayed(&self) -> bool {
        let now = Instant::now();
        self.not_before.iter().any(|(id, at)| {
            *at > now
                && self
                    .nodes
                    .get(id)
                    .is_some_and(|s| s.status == NodeStatus::Pending)
        })
    }

    fn next_wait(&self) -> Duration {
        let poll = self.config.poll_interval();
        let now = Instant::now();
        self.not_before
            .values()
            .filter(|at| **at > now)
            .map(|at| *at - now)
            .min()
            .map_or(poll, |d| d.min(poll))
    }

    async fn pause(&mut self, mode: PauseMode) -> Result<()> {
        self.set_graph_status(GraphStatus::Paused)?;
        info!(project = %self.project, ?mode, "paused");
        self.snapshot().await;
        Ok(())
    }

    /// Nothing is ready and nothing is running: finish or report the stall.
    async fn settle(&mut self) -> Result<()> {
        if self.state.completed_nodes.len() == self.graph.node_count() {
            self.set_graph_status(GraphStatus::Completed)?;
            self.snapshot().await;
            info!(project = %self.project, nodes = self.graph.node_count(), "execution finished");
            self.emit(EngineEvent::ExecutionFinished {
                project: self.project.clone(),
                status: self.state.status,
                progress: self.state.progress,
            });
            return Ok(());
        }

        let stalled: Vec<(&NodeId, &NodeState)> =
            self.nodes.iter().filter(|(_, s)| !s.is_completed()).collect();
        let first = stalled
            .first()
            .map(|(id, _)| (*id).clone())
            .unwrap_or_else(|| NodeId::from("graph"));
        let listing: Vec<String> = stalled
            .iter()
            .map(|(id, s)| format!("{} ({})", id, s.status))
            .collect();
        let err = Error::Execution {
            node: first,
            reason: format!("no runnable nodes left: {}", listing.join(", ")),
        };
        self.fail(&err);
        self.snapshot().await;
        Ok(())
    }

    /// Move the graph to `failed` and emit the single terminal event.
    fn fail(&mut self, err: &Error) {
        self.cancel.cancel();
        if self.state.status != GraphStatus::Failed {
            if let Err(e) = self.set_graph_status(GraphStatus::Failed) {
                warn!(project = %self.project, error = %e, "cannot mark graph failed");
            }
        }
        error!(project = %self.project, kind = %err.kind(), error = %err, "execution failed");
        self.emit(EngineEvent::ExecutionFailed {
            project: self.project.clone(),
            kind: err.kind(),
            reason: err.to_string(),
        });
    }

    /// Walk the recovery ladder after a non-fatal scheduler error.
    async fn recover(&mut self, cause: Error) -> Result<()> {
        if cause.is_fatal() {
            self.fail(&cause);
            return Err(cause);
        }
        warn!(project = %self.project, error = %cause, "scheduler error, recovering");
        self.snapshot().await;

        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch += 1;
        self.pool.release_all();
        self.not_before.clear();

        let node_ids = self.graph.node_ids();
        let recovery = recovery::recover(
            &mut self.checkpoints,
            LiveState {
                graph: &self.state,
                nodes: &self.nodes,
                memory: &self.memory,
                node_ids: &node_ids,
            },
        );
        for attempt in &recovery.attempts {
            self.emit(EngineEvent::RecoveryAttempted {
                project: self.project.clone(),
                strategy: attempt.strategy.to_string(),
                succeeded: attempt.error.is_none(),
            });
        }

        match recovery.into_result() {
            Ok((strategy, restored)) => {
                info!(project = %self.project, %strategy, version = restored.version, "state recovered");
                self.state = restored.graph;
                self.nodes = restored.nodes;
                self.memory = restored.memory;
                self.emit(EngineEvent::CheckpointRestored {
                    project: self.project.clone(),
                    name: restored.name,
                    version: restored.version,
                });
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    // ---- readiness and dispatch

    /// Pending nodes whose incoming edges pass and that a worker can take,
    /// highest priority first, dependency order within a priority.
    ///
    /// Edges that close a cycle are not considered here; they are evaluated
    /// when their source completes.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut ready: Vec<&TaskNode> = self
            .order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .is_some_and(|s| s.status == NodeStatus::Pending)
            })
            .filter(|id| self.not_before.get(*id).map_or(true, |at| *at <= now))
            .filter_map(|id| self.graph.node(id))
            .filter(|node| self.edges_satisfied(node))
            .collect();
        ready.sort_by_key(|n| std::cmp::Reverse(n.priority.rank()));
        ready.into_iter().map(|n| n.id.clone()).collect()
    }

    fn edges_satisfied(&self, node: &TaskNode) -> bool {
        self.nodes
            .get(&node.id)
            .is_some_and(|target| self.blocked_by(node, target).is_none())
    }

    /// First failing condition on the edges into `node`, or `None` when it
    /// can be dispatched. A node without gating edges still needs a worker.
    fn blocked_by(&self, node: &TaskNode, target: &NodeState) -> Option<EvaluationReason> {
        let worker_available = self.pool.select(node, &self.matcher).is_some();
        let mut gating = self
            .graph
            .incoming(&node.id)
            .into_iter()
            .filter(|edge| !edge.closes_cycle)
            .peekable();
        if gating.peek().is_none() {
            return (!worker_available).then_some(EvaluationReason::NoWorkerAvailable);
        }
        gating.find_map(|edge| {
            let Some(source) = self.nodes.get(&edge.source) else {
                return Some(EvaluationReason::SourceNotCompleted {
                    status: NodeStatus::Pending,
                });
            };
            let ctx = EvaluationContext {
                source,
                target,
                result: self.results.get(&edge.source),
                worker_available,
            };
            let outcome = self.evaluator.evaluate_base(edge, &ctx);
            (!outcome.passed).then_some(outcome.reason)
        })
    }

    fn dispatch_ready(&mut self, tx: &mpsc::Sender<NodeCompletion>) -> Result<usize> {
        let ready = self.ready_nodes();
        self.state.available_nodes = ready.clone();
        let mut dispatched = 0;
        for id in ready {
            if self.state.free_slots() == 0 {
                break;
            }
            let Some(node) = self.graph.node(&id).cloned() else {
                continue;
            };
            let Some(assignment) = self.pool.select(&node, &self.matcher) else {
                debug!(node = %id, "no worker with capacity");
                continue;
            };
            self.dispatch(node, assignment, tx)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn dispatch(
        &mut self,
        node: TaskNode,
        assignment: Assignment,
        tx: &mpsc::Sender<NodeCompletion>,
    ) -> Result<()> {
        let id = node.id.clone();
        let best = assignment
            .best
            .ok_or_else(|| Error::WorkerNotFound(format!("no worker for {}", id)))?;

        self.pool.reserve(&best.worker_id, &id)?;
        if let Err(e) = self.state.mark_running(&id) {
            self.pool.release(&id);
            return Err(e);
        }
        self.node_mut(&id)?.start(&best.worker_id)?;
        self.not_before.remove(&id);
        self.node_changed(&id, NodeStatus::Pending, NodeStatus::Running);
        info!(project = %self.project, node = %id, worker = %best.worker_id, score = best.total, "dispatching");
        self.emit(EngineEvent::NodeDispatched {
            project: self.project.clone(),
            node: id.clone(),
            worker: best.worker_id.clone(),
            score: best.total,
            justification: assignment.justification,
        });

        let original = node
            .original_task_id
            .as_ref()
            .and_then(|o| self.graph.node(o));
        let followup = self.followups.get(&id).map(PendingFollowup::as_followup);
        let request = ExecutionRequest {
            node_id: id,
            prompt: prompt::build(&node, original, followup),
            working_dir: self.working_dir.clone(),
            timeout: self.timeouts.for_task(&node),
        };

        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.child_token();
        let tx = tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let started = Instant::now();
            let limit = request.timeout;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => DispatchResult::Cancelled,
                outcome = tokio::time::timeout(limit, executor.execute(&request, cancel.clone())) => {
                    match outcome {
                        Ok(Ok(outcome)) => DispatchResult::Finished(outcome),
                        Ok(Err(e)) => DispatchResult::Errored(e.to_string()),
                        Err(_) => DispatchResult::TimedOut(limit),
                    }
                }
            };
            let completion = NodeCompletion {
                node: request.node_id.clone(),
                epoch,
                elapsed_ms: millis(started.elapsed()),
                result,
            };
            if tx.send(completion).await.is_err() {
                debug!(node = %request.node_id, "scheduler gone, completion dropped");
            }
        });
        Ok(())
    }

    // ---- completion handling

    async fn handle_completion(&mut self, done: NodeCompletion) -> Result<()> {
        if done.epoch != self.epoch {
            debug!(node = %done.node, epoch = done.epoch, "stale completion ignored");
            return Ok(());
        }
        let worker = self.pool.release(&done.node);
        let node = self
            .graph
            .node(&done.node)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(done.node.clone()))?;

        match done.result {
            DispatchResult::Cancelled => {
                self.node_mut(&node.id)?.reset(false);
                self.state.mark_pending(&node.id);
                self.node_changed(&node.id, NodeStatus::Running, NodeStatus::Pending);
                info!(project = %self.project, node = %node.id, "dispatch cancelled");
                Ok(())
            }
            DispatchResult::TimedOut(limit) => {
                self.complete_with_warning(&node, worker, limit, done.elapsed_ms)
                    .await
            }
            DispatchResult::Errored(reason) => {
                warn!(project = %self.project, node = %node.id, error = %reason, "executor error");
                let outcome = ExecutionOutcome::failure(reason, done.elapsed_ms);
                self.apply_outcome(&node, worker, outcome).await
            }
            DispatchResult::Finished(outcome) => self.apply_outcome(&node, worker, outcome).await,
        }
    }

    /// A timed-out node is completed without a result so the graph keeps
    /// moving; downstream quality gates decide whether that is acceptable.
    async fn complete_with_warning(
        &mut self,
        node: &TaskNode,
        worker: Option<String>,
        limit: Duration,
        elapsed_ms: u64,
    ) -> Result<()> {
        let warning = format!("timed out after {}s, completed without a result", limit.as_secs());
        warn!(project = %self.project, node = %node.id, %warning, "completed with warning");

        let state = self.node_mut(&node.id)?;
        state.finish(NodeStatus::Completed, elapsed_ms)?;
        state.quality_score = None;
        state.warning = Some(warning.clone());
        let attempt = state.retry_count;

        self.state.mark_completed(&node.id);
        self.results.insert(node.id.clone(), SourceResult::default());
        self.memory.record_execution(&ExecutionRecord {
            node: node.id.clone(),
            worker,
            success: false,
            quality_score: None,
            duration_ms: elapsed_ms,
            attempt,
            warning: Some(warning.clone()),
        })?;
        self.node_changed(&node.id, NodeStatus::Running, NodeStatus::Completed);
        self.emit(EngineEvent::NodeCompleted {
            project: self.project.clone(),
            node: node.id.clone(),
            quality_score: None,
            duration_ms: elapsed_ms,
            warning: Some(warning),
        });
        self.after_completion(&node.id).await;
        Ok(())
    }

    async fn apply_outcome(
        &mut self,
        node: &TaskNode,
        worker: Option<String>,
        outcome: ExecutionOutcome,
    ) -> Result<()> {
        let report = self.verifier.verify(&outcome);
        let attempt = self.nodes.get(&node.id).map_or(0, |s| s.retry_count);
        self.memory.record_execution(&ExecutionRecord {
            node: node.id.clone(),
            worker,
            success: report.success,
            quality_score: report.quality_score,
            duration_ms: outcome.duration_ms,
            attempt,
            warning: None,
        })?;

        let threshold = self.config.quality_threshold;
        let failure = match report.quality_score {
            _ if !report.success => Some(Error::Execution {
                node: node.id.clone(),
                reason: excerpt(&outcome.output),
            }),
            Some(score) if score < threshold => Some(Error::QualityGateFailure {
                node: node.id.clone(),
                score,
                threshold,
            }),
            _ => None,
        };
        let Some(failure) = failure else {
            return self.complete(node, &report, outcome.duration_ms).await;
        };

        warn!(project = %self.project, node = %node.id, error = %failure, "negative result");
        self.state.error_count += 1;
        self.snapshot().await;
        self.memory
            .record_pattern(false, &node.id, &failure.to_string());

        {
            let state = self.node_mut(&node.id)?;
            state.quality_score = report.quality_score;
            state.finish(NodeStatus::Failed, outcome.duration_ms)?;
            state.error_history.push(failure.to_string());
        }
        self.state.mark_failed(&node.id);
        self.node_changed(&node.id, NodeStatus::Running, NodeStatus::Failed);

        // A failed checkpoint sends the task it verifies back for rework.
        let original = node
            .original_task_id
            .as_ref()
            .filter(|_| node.is_checkpoint)
            .and_then(|o| self.graph.node(o))
            .cloned();
        let target = original.as_ref().unwrap_or(node);
        self.remediate(&node.id, target, &report, &outcome.output)
    }

    async fn complete(
        &mut self,
        node: &TaskNode,
        report: &QualityReport,
        duration_ms: u64,
    ) -> Result<()> {
        let previous_coverage = self.results.get(&node.id).and_then(|r| r.coverage);
        let state = self.node_mut(&node.id)?;
        state.finish(NodeStatus::Completed, duration_ms)?;
        state.quality_score = report.quality_score;
        state.warning = None;

        self.state.mark_completed(&node.id);
        self.followups.remove(&node.id);
        self.results.insert(
            node.id.clone(),
            SourceResult {
                success: report.success,
                quality_score: report.quality_score,
                previous_score: self.memory.previous_score(&node.id),
                issues: report.issues,
                tests_passed: report.tests_passed,
                coverage: report.coverage,
                previous_coverage,
            },
        );
        info!(project = %self.project, node = %node.id, score = ?report.quality_score, duration_ms, "node completed");
        self.node_changed(&node.id, NodeStatus::Running, NodeStatus::Completed);
        self.emit(EngineEvent::NodeCompleted {
            project: self.project.clone(),
            node: node.id.clone(),
            quality_score: report.quality_score,
            duration_ms,
            warning: None,
        });
        self.after_completion(&node.id).await;
        Ok(())
    }

    async fn after_completion(&mut self, id: &NodeId) {
        self.close_cycles(id);
        self.completions_since_snapshot += 1;
        if self.config.snapshot_every > 0
            && self.completions_since_snapshot >= self.config.snapshot_every
        {
            self.snapshot().await;
        }
    }

    /// Evaluate cycle-closing edges leaving `id`. A pass re-opens the cycle
    /// for another round; a failure (including the iteration cap) ends it.
    fn close_cycles(&mut self, id: &NodeId) {
        let closing: Vec<EdgeId> = self
            .graph
            .outgoing(id)
            .into_iter()
            .filter(|e| e.closes_cycle)
            .map(|e| e.id.clone())
            .collect();

        for edge_id in closing {
            let Some(edge) = self.graph.edge_mut(&edge_id) else {
                continue;
            };
            let (Some(source), Some(target)) =
                (self.nodes.get(&edge.source), self.nodes.get(&edge.target))
            else {
                continue;
            };
            let ctx = EvaluationContext {
                source,
                target,
                result: self.results.get(&edge.source),
                // capacity is checked again when the reopened nodes dispatch
                worker_available: true,
            };
            let outcome = self.evaluator.evaluate(edge, &ctx);
            let iteration = edge.current_iteration;
            let cycle_nodes = edge.cycle_nodes.clone();

            self.emit(EngineEvent::CycleEvaluated {
                project: self.project.clone(),
                edge: edge_id.to_string(),
                iteration,
                passed: outcome.passed,
                reason: outcome.reason.to_string(),
            });
            if outcome.passed {
                info!(project = %self.project, edge = %edge_id, iteration, "cycle re-opened");
                for node in &cycle_nodes {
                    self.reopen(node);
                }
            } else {
                info!(project = %self.project, edge = %edge_id, reason = %outcome.reason, "cycle closed");
            }
        }
    }

    /// Send a completed node back to `pending`.
    fn reopen(&mut self, id: &NodeId) {
        let Some(state) = self.nodes.get_mut(id) else {
            return;
        };
        if state.status != NodeStatus::Completed {
            return;
        }
        state.reset(false);
        self.state.mark_pending(id);
        self.node_changed(id, NodeStatus::Completed, NodeStatus::Pending);
    }

    // ---- remediation

    /// Decide and apply the remediation for `failed`.
    ///
    /// `target` is the node whose retry budget is spent: the failed node
    /// itself, or the original task when a checkpoint failed.
    fn remediate(
        &mut self,
        failed: &NodeId,
        target: &TaskNode,
        report: &QualityReport,
        output: &str,
    ) -> Result<()> {
        let severity = self.policy.classify(report);
        let target_state = self.nodes.get(&target.id).cloned().unwrap_or_default();
        match self.policy.decide(target, &target_state, report, output) {
            RemediationAction::Escalate {
                severity, message, ..
            } => self.escalate(failed, severity, &message),
            RemediationAction::Retry { attempt, delay } => self.requeue(
                failed,
                &target.id,
                severity,
                Requeue {
                    attempt,
                    followup: PendingFollowup::Retry {
                        attempt,
                        error: excerpt(output),
                    },
                    delay: Some(delay),
                    label: "retry",
                },
            ),
            RemediationAction::Rework { attempt, plan } => {
                self.memory
                    .append(REMEDIATION_PLANS, serde_json::to_value(&plan)?);
                self.requeue(
                    failed,
                    &target.id,
                    severity,
                    Requeue {
                        attempt,
                        followup: PendingFollowup::Rework {
                            attempt,
                            plan: plan.render(),
                        },
                        delay: None,
                        label: "rework",
                    },
                )
            }
        }
    }

    fn escalate(&mut self, id: &NodeId, severity: Severity, message: &str) -> Result<()> {
        self.node_mut(id)?.transition(NodeStatus::Blocked)?;
        self.state.mark_failed(id);
        self.node_changed(id, NodeStatus::Failed, NodeStatus::Blocked);
        error!(project = %self.project, node = %id, %severity, reason = %message, "manual intervention required");
        self.emit(EngineEvent::ManualInterventionRequired {
            project: self.project.clone(),
            node: id.clone(),
            severity,
            reason: message.to_string(),
        });
        Ok(())
    }

    fn requeue(
        &mut self,
        failed: &NodeId,
        target: &NodeId,
        severity: Severity,
        requeue: Requeue,
    ) -> Result<()> {
        {
            let state = self.node_mut(failed)?;
            state.transition(NodeStatus::Retry)?;
            state.transition(NodeStatus::Pending)?;
        }
        self.state.mark_pending(failed);
        self.node_changed(failed, NodeStatus::Failed, NodeStatus::Retry);
        self.node_changed(failed, NodeStatus::Retry, NodeStatus::Pending);

        if failed != target {
            let mut rollback = vec![target.clone()];
            if let Some(pair) = self.checkpoint_pairs.get(target) {
                rollback.push(pair.code_review.clone());
                rollback.push(pair.qa.clone());
            }
            for id in rollback.iter().filter(|id| *id != failed) {
                self.reopen(id);
            }
        }

        self.node_mut(target)?.retry_count = requeue.attempt;
        self.state.retry_count += 1;
        self.followups.insert(target.clone(), requeue.followup);
        if let Some(delay) = requeue.delay {
            self.not_before.insert(target.clone(), Instant::now() + delay);
        }

        info!(
            project = %self.project,
            node = %target,
            failed = %failed,
            %severity,
            action = requeue.label,
            attempt = requeue.attempt,
            "remediation scheduled"
        );
        self.emit(EngineEvent::RemediationScheduled {
            project: self.project.clone(),
            node: target.clone(),
            severity,
            action: requeue.label.to_string(),
            attempt: requeue.attempt,
        });
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("project", &self.project)
            .field("status", &self.state.status)
            .field("nodes", &self.nodes.len())
            .field("epoch", &self.epoch)
            .finish()
    }
}
