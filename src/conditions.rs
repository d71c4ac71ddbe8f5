//! Edge traversal conditions.
//!
//! Every edge carries an ordered list of conditions that must all hold before
//! its target may run. Conditions form a closed enum evaluated by
//! [`EdgeEvaluator`]; the only state an evaluation may change is the
//! iteration counter and history of a cyclical edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::graph::Edge;
use crate::core::task::{NodeState, NodeStatus};

/// A single traversal condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Condition {
    /// Source node has completed.
    Dependency,
    /// Source node's quality score meets the threshold.
    QualityGate { threshold: f64 },
    /// Target has not been requeued more than `max_retries` times.
    Retry { max_retries: u32 },
    /// A worker able to take the target has spare capacity.
    AgentAvailability,
    /// Score improved since the prior round, or meets the threshold.
    QualityImprovement { threshold: f64 },
    /// No outstanding review issues.
    ReviewFeedback,
    /// Tests pass, or coverage improved since the prior round.
    TestConvergence,
    /// Source succeeded, or fewer than `max_sub_iterations` rounds ran.
    GeneralImprovement { max_sub_iterations: u32 },
}

impl Condition {
    pub fn name(&self) -> &'static str {
        match self {
            Condition::Dependency => "dependency",
            Condition::QualityGate { .. } => "quality_gate",
            Condition::Retry { .. } => "retry",
            Condition::AgentAvailability => "agent_availability",
            Condition::QualityImprovement { .. } => "quality_improvement",
            Condition::ReviewFeedback => "review_feedback",
            Condition::TestConvergence => "test_convergence",
            Condition::GeneralImprovement { .. } => "general_improvement",
        }
    }
}

/// Most recent result reported for a source node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    pub success: bool,
    pub quality_score: Option<f64>,
    /// Score of the round before this one, if any.
    pub previous_score: Option<f64>,
    pub issues: Option<u32>,
    pub tests_passed: Option<bool>,
    pub coverage: Option<f64>,
    pub previous_coverage: Option<f64>,
}

/// Inputs to an edge evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub source: &'a NodeState,
    pub target: &'a NodeState,
    pub result: Option<&'a SourceResult>,
    pub worker_available: bool,
}

/// Why an evaluation passed or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "code")]
pub enum EvaluationReason {
    Passed,
    SourceNotCompleted { status: NodeStatus },
    QualityBelowThreshold { score: f64, threshold: f64 },
    MissingQualityScore,
    WarningRejected,
    RetriesExhausted { retry_count: u32, max_retries: u32 },
    NoWorkerAvailable,
    NoQualityImprovement { previous: Option<f64>, current: Option<f64> },
    OutstandingIssues { issues: u32 },
    TestsNotConverging,
    SubIterationCap { iteration: u32, max: u32 },
    MaxIterations { iteration: u32, max: u32 },
}

impl EvaluationReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EvaluationReason::Passed => "passed",
            EvaluationReason::SourceNotCompleted { .. } => "source_not_completed",
            EvaluationReason::QualityBelowThreshold { .. } => "quality_below_threshold",
            EvaluationReason::MissingQualityScore => "missing_quality_score",
            EvaluationReason::WarningRejected => "warning_rejected",
            EvaluationReason::RetriesExhausted { .. } => "retries_exhausted",
            EvaluationReason::NoWorkerAvailable => "no_worker_available",
            EvaluationReason::NoQualityImprovement { .. } => "no_quality_improvement",
            EvaluationReason::OutstandingIssues { .. } => "outstanding_issues",
            EvaluationReason::TestsNotConverging => "tests_not_converging",
            EvaluationReason::SubIterationCap { .. } => "sub_iteration_cap",
            EvaluationReason::MaxIterations { .. } => "max_iterations",
        }
    }
}

impl std::fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationReason::SourceNotCompleted { status } => {
                write!(f, "source is {}", status)
            }
            EvaluationReason::QualityBelowThreshold { score, threshold } => {
                write!(f, "score {:.2} below {:.2}", score, threshold)
            }
            EvaluationReason::RetriesExhausted {
                retry_count,
                max_retries,
            } => write!(f, "retries exhausted ({}/{})", retry_count, max_retries),
            EvaluationReason::OutstandingIssues { issues } => {
                write!(f, "{} outstanding issues", issues)
            }
            EvaluationReason::MaxIterations { iteration, max } => {
                write!(f, "max_iterations reached ({}/{})", iteration, max)
            }
            other => write!(f, "{}", other.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub passed: bool,
    pub reason: EvaluationReason,
}

impl EvaluationOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: EvaluationReason::Passed,
        }
    }

    pub fn fail(reason: EvaluationReason) -> Self {
        Self {
            passed: false,
            reason,
        }
    }
}

/// Audit entry appended for every evaluation of a cyclical edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    pub reason: String,
    pub source_success: Option<bool>,
    pub source_score: Option<f64>,
}

/// Evaluates edge conditions.
#[derive(Debug, Clone)]
pub struct EdgeEvaluator {
    quality_threshold: f64,
    max_sub_iterations: u32,
    warnings_pass_quality_gates: bool,
}

impl EdgeEvaluator {
    pub fn new(
        quality_threshold: f64,
        max_sub_iterations: u32,
        warnings_pass_quality_gates: bool,
    ) -> Self {
        Self {
            quality_threshold,
            max_sub_iterations,
            warnings_pass_quality_gates,
        }
    }

    /// Evaluate the edge's own conditions in order, stopping at the first
    /// failure. Pure: identical inputs give identical outcomes.
    pub fn evaluate_base(&self, edge: &Edge, ctx: &EvaluationContext<'_>) -> EvaluationOutcome {
        self.evaluate_all(edge.conditions.iter(), edge.current_iteration, ctx)
    }

    /// Full evaluation.
    ///
    /// Non-cyclical edges behave exactly like [`Self::evaluate_base`]. A
    /// cyclical edge fails with `max_iterations` once its bound is reached;
    /// otherwise the purpose condition is appended to its own list. A pass
    /// advances the iteration counter. Every cyclical evaluation is recorded.
    pub fn evaluate(&self, edge: &mut Edge, ctx: &EvaluationContext<'_>) -> EvaluationOutcome {
        if !edge.is_cyclical {
            return self.evaluate_base(edge, ctx);
        }

        let outcome = if edge.current_iteration >= edge.max_iterations {
            EvaluationOutcome::fail(EvaluationReason::MaxIterations {
                iteration: edge.current_iteration,
                max: edge.max_iterations,
            })
        } else {
            let extra = edge
                .cycle_purpose
                .map(|p| p.condition(self.quality_threshold, self.max_sub_iterations));
            self.evaluate_all(
                edge.conditions.iter().chain(extra.iter()),
                edge.current_iteration,
                ctx,
            )
        };

        edge.history.push(EvaluationRecord {
            iteration: edge.current_iteration,
            timestamp: Utc::now(),
            passed: outcome.passed,
            reason: outcome.reason.code().to_string(),
            source_success: ctx.result.map(|r| r.success),
            source_score: ctx.source.quality_score,
        });
        if outcome.passed {
            edge.current_iteration += 1;
        }
        outcome
    }

    fn evaluate_all<'c>(
        &self,
        conditions: impl Iterator<Item = &'c Condition>,
        iteration: u32,
        ctx: &EvaluationContext<'_>,
    ) -> EvaluationOutcome {
        for condition in conditions {
            let outcome = self.check(condition, iteration, ctx);
            if !outcome.passed {
                return outcome;
            }
        }
        EvaluationOutcome::pass()
    }

    fn check(
        &self,
        condition: &Condition,
        iteration: u32,
        ctx: &EvaluationContext<'_>,
    ) -> EvaluationOutcome {
        match condition {
            Condition::Dependency => {
                if ctx.source.status == NodeStatus::Completed {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::SourceNotCompleted {
                        status: ctx.source.status,
                    })
                }
            }
            Condition::QualityGate { threshold } => match ctx.source.quality_score {
                Some(score) if score >= *threshold => EvaluationOutcome::pass(),
                Some(score) => EvaluationOutcome::fail(EvaluationReason::QualityBelowThreshold {
                    score,
                    threshold: *threshold,
                }),
                None if ctx.source.warning.is_some() => {
                    if self.warnings_pass_quality_gates {
                        EvaluationOutcome::pass()
                    } else {
                        EvaluationOutcome::fail(EvaluationReason::WarningRejected)
                    }
                }
                None => EvaluationOutcome::fail(EvaluationReason::MissingQualityScore),
            },
            Condition::Retry { max_retries } => {
                if ctx.target.retry_count <= *max_retries {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::RetriesExhausted {
                        retry_count: ctx.target.retry_count,
                        max_retries: *max_retries,
                    })
                }
            }
            Condition::AgentAvailability => {
                if ctx.worker_available {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::NoWorkerAvailable)
                }
            }
            Condition::QualityImprovement { threshold } => {
                let current = ctx
                    .result
                    .and_then(|r| r.quality_score)
                    .or(ctx.source.quality_score);
                let previous = ctx.result.and_then(|r| r.previous_score);
                let improved = matches!((previous, current), (Some(p), Some(c)) if c > p);
                let meets = current.is_some_and(|c| c >= *threshold);
                if improved || meets {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::NoQualityImprovement {
                        previous,
                        current,
                    })
                }
            }
            Condition::ReviewFeedback => {
                let issues = ctx.result.and_then(|r| r.issues).unwrap_or(0);
                if issues == 0 {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::OutstandingIssues { issues })
                }
            }
            Condition::TestConvergence => {
                let Some(result) = ctx.result else {
                    return EvaluationOutcome::fail(EvaluationReason::TestsNotConverging);
                };
                let passing = result.tests_passed.unwrap_or(false);
                let coverage_up = matches!(
                    (result.previous_coverage, result.coverage),
                    (Some(p), Some(c)) if c > p
                );
                if passing || coverage_up {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::TestsNotConverging)
                }
            }
            Condition::GeneralImprovement { max_sub_iterations } => {
                let success = ctx.result.map(|r| r.success).unwrap_or(false);
                if success || iteration < *max_sub_iterations {
                    EvaluationOutcome::pass()
                } else {
                    EvaluationOutcome::fail(EvaluationReason::SubIterationCap {
                        iteration,
                        max: *max_sub_iterations,
                    })
                }
            }
        }
    }
}

impl Default for EdgeEvaluator {
    fn default() -> Self {
        Self::new(0.7, 3, true)
    }
}
