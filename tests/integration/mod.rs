//! Integration test suite.
//!
//! Each scenario drives a real `Scheduler` (or `ProjectRegistry`) against a
//! scripted executor, so no external program is ever spawned.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: graph construction through to a completed run, ordering
//!   and parallelism
//! - `remediation`: retries, rework and escalation
//! - `recovery`: checkpoints, orphaned dispatches and the recovery ladder
//! - `persistence`: file-backed checkpoints and resuming a project
//! - `multi_project`: independent projects running side by side

mod fixtures;

mod multi_project;
mod persistence;
mod recovery;
mod remediation;
mod workflow_e2e;
