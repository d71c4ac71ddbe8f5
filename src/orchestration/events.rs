//! Outbound engine events.
//!
//! The scheduler never calls an [`EventSink`] directly. It pushes
//! [`EngineEvent`]s into a bounded crossbeam channel with `try_send`; a
//! dedicated forwarder thread drains the channel into the sink. A full queue
//! drops the event and bumps a counter instead of blocking the run loop.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::core::graph::GraphStatus;
use crate::core::task::{NodeId, NodeStatus};
use crate::error::ErrorKind;
use crate::orchestration::remediation::Severity;
use crate::state::persistence::ProjectId;

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    GraphStatusChanged {
        project: ProjectId,
        from: GraphStatus,
        to: GraphStatus,
    },
    NodeStatusChanged {
        project: ProjectId,
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
    NodeDispatched {
        project: ProjectId,
        node: NodeId,
        worker: String,
        score: f64,
        justification: String,
    },
    NodeCompleted {
        project: ProjectId,
        node: NodeId,
        quality_score: Option<f64>,
        duration_ms: u64,
        warning: Option<String>,
    },
    CycleEvaluated {
        project: ProjectId,
        edge: String,
        iteration: u32,
        passed: bool,
        reason: String,
    },
    CheckpointCreated {
        project: ProjectId,
        name: String,
        version: u64,
    },
    CheckpointRestored {
        project: ProjectId,
        name: String,
        version: u64,
    },
    RecoveryAttempted {
        project: ProjectId,
        strategy: String,
        succeeded: bool,
    },
    RemediationScheduled {
        project: ProjectId,
        node: NodeId,
        severity: Severity,
        action: String,
        attempt: u32,
    },
    ManualInterventionRequired {
        project: ProjectId,
        node: NodeId,
        severity: Severity,
        reason: String,
    },
    /// Single terminal event for a fatal error.
    ExecutionFailed {
        project: ProjectId,
        kind: ErrorKind,
        reason: String,
    },
    ExecutionFinished {
        project: ProjectId,
        status: GraphStatus,
        progress: f64,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::GraphStatusChanged { .. } => "graph_status_changed",
            EngineEvent::NodeStatusChanged { .. } => "node_status_changed",
            EngineEvent::NodeDispatched { .. } => "node_dispatched",
            EngineEvent::NodeCompleted { .. } => "node_completed",
            EngineEvent::CycleEvaluated { .. } => "cycle_evaluated",
            EngineEvent::CheckpointCreated { .. } => "checkpoint_created",
            EngineEvent::CheckpointRestored { .. } => "checkpoint_restored",
            EngineEvent::RecoveryAttempted { .. } => "recovery_attempted",
            EngineEvent::RemediationScheduled { .. } => "remediation_scheduled",
            EngineEvent::ManualInterventionRequired { .. } => "manual_intervention_required",
            EngineEvent::ExecutionFailed { .. } => "execution_failed",
            EngineEvent::ExecutionFinished { .. } => "execution_finished",
        }
    }

    /// Event fields as a JSON map, without the type tag.
    pub fn payload(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("type");
                map
            }
            _ => Map::new(),
        }
    }
}

/// Receiver of engine events. Must not block for long.
pub trait EventSink: Send + Sync {
    fn publish(&self, event_type: &str, payload: &Map<String, Value>);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event_type: &str, payload: &Map<String, Value>) {
        let payload = Value::Object(payload.clone());
        match event_type {
            "execution_failed" | "manual_intervention_required" => {
                error!(event = event_type, %payload, "engine event")
            }
            "remediation_scheduled" | "recovery_attempted" => {
                warn!(event = event_type, %payload, "engine event")
            }
            "node_status_changed" | "cycle_evaluated" => {
                debug!(event = event_type, %payload, "engine event")
            }
            _ => info!(event = event_type, %payload, "engine event"),
        }
    }
}

/// Collects events in memory; used by tests and the CLI report.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Map<String, Value>)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|(t, _)| t == event_type).count())
            .unwrap_or(0)
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event_type: &str, payload: &Map<String, Value>) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event_type.to_string(), payload.clone()));
        }
    }
}

/// Cheap, cloneable handle for pushing events onto the bus.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: Sender<EngineEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Enqueue without blocking. Returns false if the event was dropped.
    pub fn publish(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event = event.event_type(), "event dropped");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded queue plus forwarder thread.
pub struct EventBus {
    publisher: Option<EventPublisher>,
    forwarder: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<EngineEvent>(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let forwarder = thread::Builder::new()
            .name("cadence-events".to_string())
            .spawn(move || forward(rx, sink));
        let forwarder = match forwarder {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn event forwarder; events will be dropped");
                None
            }
        };
        Self {
            publisher: Some(EventPublisher {
                tx,
                dropped: dropped.clone(),
            }),
            forwarder,
            dropped,
        }
    }

    /// Handle for producers. Panics never; returns a disconnected handle
    /// after shutdown.
    pub fn publisher(&self) -> EventPublisher {
        match &self.publisher {
            Some(publisher) => publisher.clone(),
            None => {
                let (tx, _) = crossbeam_channel::bounded(1);
                EventPublisher {
                    tx,
                    dropped: self.dropped.clone(),
                }
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the forwarder to drain it.
    ///
    /// Blocks until every outstanding `EventPublisher` clone is dropped.
    pub fn shutdown(mut self) {
        self.publisher.take();
        if let Some(handle) = self.forwarder.take() {
            if handle.join().is_err() {
                error!("event forwarder panicked");
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Detach; the forwarder exits once the last publisher is gone.
        self.publisher.take();
    }
}

fn forward(rx: Receiver<EngineEvent>, sink: Arc<dyn EventSink>) {
    for event in rx.iter() {
        sink.publish(event.event_type(), &event.payload());
    }
    debug!("event forwarder stopped");
}
