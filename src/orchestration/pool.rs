//! Worker pool with per-worker concurrency accounting.
//!
//! The `WorkerPool` owns the roster of worker profiles and tracks which node
//! each worker is currently running. Only the scheduler loop mutates it, so
//! it needs no locking.

use std::collections::HashMap;

use crate::core::task::{NodeId, TaskNode};
use crate::error::{Error, Result};
use crate::orchestration::matcher::{Assignment, CapabilityMatcher, WorkerProfile};

/// Tracks worker capacity for one project.
///
/// # Example
///
/// ```
/// use cadence::orchestration::{WorkerPool, WorkerProfile};
///
/// let mut pool = WorkerPool::new(WorkerProfile::default_roster());
/// assert!(pool.has_capacity("developer"));
/// pool.reserve("developer", &"task-1".into()).unwrap();
/// assert_eq!(pool.in_flight("developer"), 1);
/// ```
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// Worker profiles in roster order.
    workers: Vec<WorkerProfile>,
    /// In-flight count per worker id.
    in_flight: HashMap<String, usize>,
    /// Node currently held by each reservation.
    assignments: HashMap<NodeId, String>,
}

impl WorkerPool {
    /// Create a pool from a roster.
    ///
    /// An empty roster falls back to [`WorkerProfile::default_roster`].
    pub fn new(workers: Vec<WorkerProfile>) -> Self {
        let workers = if workers.is_empty() {
            WorkerProfile::default_roster()
        } else {
            workers
        };
        Self {
            workers,
            in_flight: HashMap::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn workers(&self) -> &[WorkerProfile] {
        &self.workers
    }

    pub fn get(&self, id: &str) -> Option<&WorkerProfile> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Number of nodes a worker is currently running.
    pub fn in_flight(&self, id: &str) -> usize {
        self.in_flight.get(id).copied().unwrap_or(0)
    }

    pub fn total_in_flight(&self) -> usize {
        self.assignments.len()
    }

    pub fn has_capacity(&self, id: &str) -> bool {
        self.get(id)
            .map(|w| self.in_flight(id) < w.max_concurrent)
            .unwrap_or(false)
    }

    /// Worker holding `node`, if any.
    pub fn assigned_to(&self, node: &NodeId) -> Option<&str> {
        self.assignments.get(node).map(String::as_str)
    }

    /// Rank workers with spare capacity for `task`.
    ///
    /// Returns `None` when no worker with capacity scores above zero.
    pub fn select(&self, task: &TaskNode, matcher: &CapabilityMatcher) -> Option<Assignment> {
        let available = self.workers.iter().filter(|w| self.has_capacity(&w.id));
        let assignment = matcher.find_best(task, available, |id| self.in_flight(id));
        assignment.best.is_some().then_some(assignment)
    }

    /// Claim one slot of `worker` for `node`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerNotFound` for an unknown id and `WorkerAtCapacity` when
    /// the worker has no free slot.
    pub fn reserve(&mut self, worker: &str, node: &NodeId) -> Result<()> {
        let profile = self
            .get(worker)
            .ok_or_else(|| Error::WorkerNotFound(worker.to_string()))?;
        let max = profile.max_concurrent;
        if self.in_flight(worker) >= max {
            return Err(Error::WorkerAtCapacity {
                id: worker.to_string(),
                max,
            });
        }
        *self.in_flight.entry(worker.to_string()).or_insert(0) += 1;
        self.assignments.insert(node.clone(), worker.to_string());
        Ok(())
    }

    /// Release the slot held for `node`. Returns the worker that held it.
    pub fn release(&mut self, node: &NodeId) -> Option<String> {
        let worker = self.assignments.remove(node)?;
        if let Some(count) = self.in_flight.get_mut(&worker) {
            *count = count.saturating_sub(1);
        }
        Some(worker)
    }

    /// Drop every reservation.
    pub fn release_all(&mut self) {
        self.assignments.clear();
        self.in_flight.clear();
    }
}
