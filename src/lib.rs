//! Task-graph orchestration engine.
//!
//! A project is a list of tasks. [`core::GraphBuilder`] turns it into a
//! dependency graph with a code-review and QA checkpoint behind every task,
//! and [`orchestration::Scheduler`] runs the graph against a
//! [`orchestration::TaskExecutor`], gating each edge on its conditions,
//! remediating failures and recovering from checkpoints.

pub mod conditions;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod registry;
pub mod state;

pub use error::{Error, Result};
