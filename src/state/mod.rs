//! Execution state that outlives a single scheduler pass.
//!
//! The memory bank accumulates execution context, the checkpoint store keeps
//! versioned snapshots of live state, the recovery ladder restores from them,
//! and a `PersistenceStore` writes checkpoints somewhere durable.

pub mod checkpoint;
pub mod memory;
pub mod persistence;
pub mod recovery;

pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointStore, RestoredState};
pub use memory::{ExecutionRecord, MemoryBank, MemoryEntry, WorkerStats};
pub use persistence::{FileStore, InMemoryStore, PersistenceStore, ProjectId, ProjectSummary};
pub use recovery::{Recovery, RecoveryAttempt, RecoveryStrategy};
