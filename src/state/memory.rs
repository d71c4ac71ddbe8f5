//! Memory bank: append-only execution context per category.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::task::NodeId;
use crate::error::Result;

pub const EXECUTION_HISTORY: &str = "execution_history";
pub const FAILURE_PATTERNS: &str = "failure_patterns";
pub const SUCCESS_PATTERNS: &str = "success_patterns";
pub const RECOVERY_LOG: &str = "recovery_log";
pub const REMEDIATION_PLANS: &str = "remediation_plans";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Bank-wide sequence number, strictly increasing.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub data: Value,
}

/// One finished dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub node: NodeId,
    pub worker: Option<String>,
    pub success: bool,
    pub quality_score: Option<f64>,
    pub duration_ms: u64,
    pub attempt: u32,
    #[serde(default)]
    pub warning: Option<String>,
}

/// Aggregate of a worker's execution history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub runs: usize,
    pub successes: usize,
    pub average_score: Option<f64>,
    pub average_duration_ms: u64,
}

impl WorkerStats {
    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.successes as f64 / self.runs as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryBank {
    categories: BTreeMap<String, Vec<MemoryEntry>>,
    next_seq: u64,
}

impl MemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `category`. Returns its sequence number.
    pub fn append(&mut self, category: &str, data: Value) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.categories
            .entry(category.to_string())
            .or_default()
            .push(MemoryEntry {
                seq,
                recorded_at: Utc::now(),
                data,
            });
        seq
    }

    pub fn entries(&self, category: &str) -> &[MemoryEntry] {
        self.categories
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_execution(&mut self, record: &ExecutionRecord) -> Result<u64> {
        Ok(self.append(EXECUTION_HISTORY, serde_json::to_value(record)?))
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.entries(EXECUTION_HISTORY)
            .iter()
            .filter_map(|e| serde_json::from_value(e.data.clone()).ok())
            .collect()
    }

    /// Remember a failure or success pattern for a node.
    pub fn record_pattern(&mut self, success: bool, node: &NodeId, description: &str) -> u64 {
        let category = if success {
            SUCCESS_PATTERNS
        } else {
            FAILURE_PATTERNS
        };
        self.append(
            category,
            serde_json::json!({ "node": node, "description": description }),
        )
    }

    pub fn worker_stats(&self, worker: &str) -> WorkerStats {
        let runs: Vec<ExecutionRecord> = self
            .executions()
            .into_iter()
            .filter(|r| r.worker.as_deref() == Some(worker))
            .collect();
        if runs.is_empty() {
            return WorkerStats::default();
        }
        let scores: Vec<f64> = runs.iter().filter_map(|r| r.quality_score).collect();
        WorkerStats {
            runs: runs.len(),
            successes: runs.iter().filter(|r| r.success).count(),
            average_score: (!scores.is_empty())
                .then(|| scores.iter().sum::<f64>() / scores.len() as f64),
            average_duration_ms: runs.iter().map(|r| r.duration_ms).sum::<u64>()
                / runs.len() as u64,
        }
    }

    /// Score of the latest execution of `node` before the most recent one.
    pub fn previous_score(&self, node: &NodeId) -> Option<f64> {
        self.executions()
            .into_iter()
            .rev()
            .filter(|r| &r.node == node)
            .nth(1)
            .and_then(|r| r.quality_score)
    }

    /// Highest sequence number present, if any.
    fn high_water(&self) -> Option<u64> {
        self.categories
            .values()
            .flat_map(|entries| entries.iter().map(|e| e.seq))
            .max()
    }

    /// State to keep after restoring `snapshot`: its entries plus whatever
    /// `self` appended after it was taken.
    pub fn merged_onto(&self, snapshot: &MemoryBank) -> MemoryBank {
        let mut merged = snapshot.clone();
        let cutoff = snapshot.high_water();
        for (category, entries) in &self.categories {
            let newer = entries
                .iter()
                .filter(|e| cutoff.map_or(true, |c| e.seq > c))
                .cloned();
            merged
                .categories
                .entry(category.clone())
                .or_default()
                .extend(newer);
        }
        merged.next_seq = merged.next_seq.max(self.next_seq);
        merged
    }
}
