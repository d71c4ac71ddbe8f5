//! Failure remediation tests: retry, rework, escalation and manual retry.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use cadence::config::{EngineConfig, TimeoutConfig};
use cadence::core::{GraphStatus, NodeId, NodeStatus};
use cadence::orchestration::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use cadence::state::memory::{FAILURE_PATTERNS, REMEDIATION_PLANS};

use crate::fixtures::{chain_abc, fast_config, login_form, Harness, MockExecutor};

/// Given a task that fails once without failure signals
/// When the project runs
/// Then the task is retried with the previous error and the run completes
#[tokio::test(start_paused = true)]
async fn test_minor_failure_retries_with_context() {
    let executor = MockExecutor::failing_first("login", 1, "npm ERR! network timeout");
    let mut harness = Harness::new("retry", &login_form(), fast_config(), executor.clone());
    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(report.retry_count, 1);
    let prompts = executor.prompts("login");
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("RETRY (attempt 1)"));
    assert!(prompts[1].contains("npm ERR! network timeout"));

    let memory = harness.scheduler.memory();
    assert_eq!(memory.entries(FAILURE_PATTERNS).len(), 1);
    let attempts: Vec<u32> = memory
        .executions()
        .iter()
        .filter(|r| r.node.as_str() == "login")
        .map(|r| r.attempt)
        .collect();
    assert_eq!(attempts, vec![0, 1]);

    let sink = harness.finish();
    assert_eq!(sink.count("remediation_scheduled"), 1);
    assert_eq!(sink.count("manual_intervention_required"), 0);
}

/// Given a code review that scores in the moderate band
/// When the project runs
/// Then the original task is reworked against a plan before review repeats
#[tokio::test(start_paused = true)]
async fn test_failed_review_reworks_task() {
    let executor = MockExecutor::new(|id, previous| {
        if id.as_str() == "b-code-review" && previous == 0 {
            ExecutionOutcome::success("quality_score: 0.5\nissues: 4", 20)
        } else {
            ExecutionOutcome::success("quality_score: 0.9", 20)
        }
    });
    let mut harness = Harness::new("rework", &chain_abc(), fast_config(), executor.clone());
    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.status, GraphStatus::Completed);

    let task_prompts = executor.prompts("b");
    assert_eq!(task_prompts.len(), 2);
    assert!(task_prompts[1].contains("REWORK (attempt 1)"));
    assert!(task_prompts[1].contains("4 outstanding issues"));
    assert_eq!(executor.prompts("b-code-review").len(), 2);
    assert_eq!(executor.prompts("a").len(), 1);

    let plans = harness.scheduler.memory().entries(REMEDIATION_PLANS);
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].data["node"], "b");

    // c never ran against an unreviewed b
    let order = executor.order();
    let second_review = order
        .iter()
        .rposition(|n| n == "b-code-review")
        .unwrap();
    let c = order.iter().position(|n| n == "c").unwrap();
    assert!(second_review < c);
}

/// Given a build failure
/// When the project runs
/// Then the node is blocked, dependents never run and the graph fails
#[tokio::test(start_paused = true)]
async fn test_critical_failure_blocks_downstream() {
    let executor = MockExecutor::failing_first("a", usize::MAX, "error[E0308]: build failed");
    let mut harness = Harness::new("critical", &chain_abc(), fast_config(), executor.clone());
    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Failed);
    assert_eq!(report.nodes[&NodeId::from("a")], NodeStatus::Blocked);
    assert_eq!(report.nodes[&NodeId::from("b")], NodeStatus::Pending);
    assert_eq!(executor.call_count(), 1);

    let sink = harness.finish();
    assert_eq!(sink.count("manual_intervention_required"), 1);
    assert_eq!(sink.count("execution_failed"), 1);
    let failed = sink
        .events()
        .into_iter()
        .find(|(kind, _)| kind == "execution_failed")
        .map(|(_, payload)| payload)
        .unwrap();
    assert_eq!(failed["kind"], "execution");
    assert!(failed["reason"].as_str().unwrap().contains("blocked"));
}

/// Given a task that keeps failing
/// When its retries run out
/// Then it is escalated, and a manual retry later completes the run
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_then_manual_retry() {
    let config = EngineConfig {
        max_retries: 1,
        ..fast_config()
    };
    let executor = MockExecutor::failing_first("login", 2, "flaky dependency");
    let mut harness = Harness::new("exhaust", &login_form(), config, executor.clone());

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.status, GraphStatus::Failed);
    assert_eq!(report.nodes[&NodeId::from("login")], NodeStatus::Blocked);
    assert_eq!(executor.prompts("login").len(), 2);

    assert_eq!(harness.scheduler.retry_failed().unwrap(), 1);
    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(executor.prompts("login").len(), 3);
}

/// Given an executor that never answers
/// When every node times out
/// Then nodes complete with warnings instead of hanging the run
#[tokio::test(start_paused = true)]
async fn test_timeouts_complete_with_warnings() {
    let config = EngineConfig {
        timeouts: TimeoutConfig {
            default_secs: 1,
            extended_secs: 1,
        },
        ..fast_config()
    };
    let mut harness = Harness::new("timeout", &login_form(), config, Arc::new(Stall));
    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.status, GraphStatus::Completed);
    assert_eq!(report.warnings.len(), 5);
    assert!(report.warnings[&NodeId::from("login")].contains("timed out after 1s"));
    assert!(report.nodes.values().all(|s| *s == NodeStatus::Completed));
}

/// Never answers until cancelled.
struct Stall;

#[async_trait]
impl TaskExecutor for Stall {
    async fn execute(
        &self,
        _request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> cadence::Result<ExecutionOutcome> {
        cancel.cancelled().await;
        Ok(ExecutionOutcome::failure("cancelled", 0))
    }
}
