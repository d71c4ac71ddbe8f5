//! In-process checkpoint store.
//!
//! A checkpoint is an immutable deep copy of the graph state, the per-node
//! state map and the memory bank. Named checkpoints (`initialized`,
//! `execution_start`, ...) are kept for the life of the run; automatic
//! snapshots are capped at the retention count, oldest evicted first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

use crate::core::graph::GraphState;
use crate::core::task::{NodeId, NodeState};
use crate::error::{Error, Result};
use crate::state::memory::MemoryBank;

pub const INITIALIZED: &str = "initialized";
pub const EXECUTION_START: &str = "execution_start";
const AUTO_PREFIX: &str = "auto-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Named,
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub kind: CheckpointKind,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub graph: GraphState,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub memory: MemoryBank,
}

impl Checkpoint {
    /// Structural validation against the graph's node ids.
    ///
    /// # Errors
    /// `Checkpoint` when a field is missing, a node-state id is unknown, a
    /// graph node has no state, or the graph-state invariants do not hold
    /// (including every current node being `running`).
    pub fn validate(&self, node_ids: &BTreeSet<NodeId>) -> Result<()> {
        if self.name.is_empty() || self.version == 0 {
            return Err(Error::Checkpoint("checkpoint missing name or version".into()));
        }
        if let Some(unknown) = self.nodes.keys().find(|id| !node_ids.contains(*id)) {
            return Err(Error::Checkpoint(format!(
                "{}: node state for unknown node {}",
                self.name, unknown
            )));
        }
        if let Some(missing) = node_ids.iter().find(|id| !self.nodes.contains_key(*id)) {
            return Err(Error::Checkpoint(format!(
                "{}: no state for node {}",
                self.name, missing
            )));
        }
        self.graph
            .check_invariants(&self.nodes)
            .map_err(|e| Error::Checkpoint(format!("{}: {}", self.name, e)))
    }
}

/// Live state handed back by a restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub name: String,
    pub version: u64,
    pub graph: GraphState,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub memory: MemoryBank,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    named: BTreeMap<String, Checkpoint>,
    automatic: VecDeque<Checkpoint>,
    retention: usize,
    /// Last version handed out; never decreases.
    counter: u64,
    /// Version of the state currently live.
    live_version: u64,
    auto_seq: u64,
}

impl CheckpointStore {
    pub fn new(retention: usize) -> Self {
        Self {
            named: BTreeMap::new(),
            automatic: VecDeque::new(),
            retention: retention.max(1),
            counter: 0,
            live_version: 0,
            auto_seq: 0,
        }
    }

    pub fn live_version(&self) -> u64 {
        self.live_version
    }

    fn snapshot(
        &mut self,
        name: String,
        kind: CheckpointKind,
        graph: &GraphState,
        nodes: &BTreeMap<NodeId, NodeState>,
        memory: &MemoryBank,
    ) -> Checkpoint {
        self.counter += 1;
        self.live_version = self.counter;
        Checkpoint {
            name,
            kind,
            version: self.counter,
            created_at: Utc::now(),
            graph: graph.clone(),
            nodes: nodes.clone(),
            memory: memory.clone(),
        }
    }

    /// Create (or replace) a named checkpoint.
    pub fn create(
        &mut self,
        name: &str,
        graph: &GraphState,
        nodes: &BTreeMap<NodeId, NodeState>,
        memory: &MemoryBank,
    ) -> Checkpoint {
        let checkpoint = self.snapshot(name.to_string(), CheckpointKind::Named, graph, nodes, memory);
        self.named.insert(name.to_string(), checkpoint.clone());
        info!(name, version = checkpoint.version, "checkpoint created");
        checkpoint
    }

    /// Create an automatic snapshot, evicting the oldest beyond retention.
    pub fn create_automatic(
        &mut self,
        graph: &GraphState,
        nodes: &BTreeMap<NodeId, NodeState>,
        memory: &MemoryBank,
    ) -> Checkpoint {
        self.auto_seq += 1;
        let name = format!("{}{}", AUTO_PREFIX, self.auto_seq);
        let checkpoint = self.snapshot(name, CheckpointKind::Automatic, graph, nodes, memory);
        self.automatic.push_back(checkpoint.clone());
        while self.automatic.len() > self.retention {
            if let Some(evicted) = self.automatic.pop_front() {
                debug!(name = %evicted.name, "automatic snapshot evicted");
            }
        }
        debug!(name = %checkpoint.name, version = checkpoint.version, "automatic snapshot");
        checkpoint
    }

    pub fn get(&self, name: &str) -> Option<&Checkpoint> {
        self.named
            .get(name)
            .or_else(|| self.automatic.iter().find(|c| c.name == name))
    }

    pub fn latest_automatic(&self) -> Option<&Checkpoint> {
        self.automatic.back()
    }

    pub fn automatic_count(&self) -> usize {
        self.automatic.len()
    }

    /// Every checkpoint, named first then automatic oldest-first.
    pub fn all(&self) -> impl Iterator<Item = &Checkpoint> {
        self.named.values().chain(self.automatic.iter())
    }

    /// Adopt a checkpoint loaded from persistence.
    pub fn insert(&mut self, checkpoint: Checkpoint) {
        self.counter = self.counter.max(checkpoint.version);
        match checkpoint.kind {
            CheckpointKind::Named => {
                self.named.insert(checkpoint.name.clone(), checkpoint);
            }
            CheckpointKind::Automatic => {
                self.automatic.push_back(checkpoint);
                while self.automatic.len() > self.retention {
                    self.automatic.pop_front();
                }
            }
        }
    }

    /// Validate then deep-copy `name` back into live state.
    ///
    /// `live_memory` entries appended after the snapshot are kept. The live
    /// version becomes the checkpoint's version.
    pub fn restore(
        &mut self,
        name: &str,
        node_ids: &BTreeSet<NodeId>,
        live_memory: &MemoryBank,
    ) -> Result<RestoredState> {
        let checkpoint = self
            .get(name)
            .ok_or_else(|| Error::Checkpoint(format!("no checkpoint named {}", name)))?;
        checkpoint.validate(node_ids)?;

        let restored = RestoredState {
            name: checkpoint.name.clone(),
            version: checkpoint.version,
            graph: checkpoint.graph.clone(),
            nodes: checkpoint.nodes.clone(),
            memory: live_memory.merged_onto(&checkpoint.memory),
        };
        self.live_version = restored.version;
        info!(name, version = restored.version, "checkpoint restored");
        Ok(restored)
    }
}
