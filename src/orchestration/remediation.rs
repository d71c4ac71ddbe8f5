//! Failure classification and remediation policy.
//!
//! A negative result is classified by severity:
//! - `Critical`: build/compile failure, security-critical finding, runtime
//!   startup failure, or a score below the critical cutoff
//! - `Moderate`: a score below the moderate cutoff
//! - `Minor`: anything else
//!
//! Minor failures are retried with an enriched prompt and exponential
//! backoff. Moderate failures are reworked against a remediation plan.
//! Critical failures block the node and ask for manual intervention.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{BackoffConfig, SeverityThresholds};
use crate::core::task::{NodeId, NodeState, TaskNode};
use crate::orchestration::verifier::QualityReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Minor => write!(f, "minor"),
            Severity::Moderate => write!(f, "moderate"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Signals detected in executor output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignals {
    pub build_failure: bool,
    pub security_critical: bool,
    pub startup_failure: bool,
}

impl FailureSignals {
    pub fn any(&self) -> bool {
        self.build_failure || self.security_critical || self.startup_failure
    }

    fn describe(&self) -> Vec<String> {
        let mut found = Vec::new();
        if self.build_failure {
            found.push("build or compilation failure".to_string());
        }
        if self.security_critical {
            found.push("security-critical finding".to_string());
        }
        if self.startup_failure {
            found.push("runtime startup failure".to_string());
        }
        found
    }
}

/// Classify a failed result.
pub fn classify(
    signals: &FailureSignals,
    score: Option<f64>,
    thresholds: &SeverityThresholds,
) -> Severity {
    if signals.any() {
        return Severity::Critical;
    }
    match score {
        Some(s) if s < thresholds.critical_below => Severity::Critical,
        Some(s) if s < thresholds.moderate_below => Severity::Moderate,
        _ => Severity::Minor,
    }
}

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.max_ms),
        )
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// Structured instructions for a rework dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub node: NodeId,
    pub severity: Severity,
    pub score: Option<f64>,
    pub findings: Vec<String>,
    pub steps: Vec<String>,
}

impl RemediationPlan {
    fn build(node: &TaskNode, report: &QualityReport, error: &str, severity: Severity) -> Self {
        let mut findings = report.signals.describe();
        if let Some(score) = report.quality_score {
            findings.push(format!("quality score {:.2}", score));
        }
        if let Some(issues) = report.issues.filter(|n| *n > 0) {
            findings.push(format!("{} outstanding issues", issues));
        }
        if report.tests_passed == Some(false) {
            findings.push("failing tests".to_string());
        }
        let excerpt: String = error.chars().take(500).collect();
        if !excerpt.trim().is_empty() {
            findings.push(format!("last output: {}", excerpt.trim()));
        }

        let mut steps = vec![format!("Re-read the requirements for \"{}\".", node.title)];
        if report.issues.is_some_and(|n| n > 0) {
            steps.push("Resolve every outstanding review issue.".to_string());
        }
        if report.tests_passed == Some(false) {
            steps.push("Fix the failing tests before anything else.".to_string());
        }
        steps.push("Raise the result above the quality threshold and report quality_score.".to_string());

        Self {
            node: node.id.clone(),
            severity,
            score: report.quality_score,
            findings,
            steps,
        }
    }

    pub fn render(&self) -> String {
        let mut text = String::from("REMEDIATION PLAN\nFindings:\n");
        for finding in &self.findings {
            text.push_str(&format!("- {}\n", finding));
        }
        text.push_str("Steps:\n");
        for (i, step) in self.steps.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, step));
        }
        text
    }
}

/// Why a node is escalated rather than retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    CriticalFailure,
    RetriesExhausted,
}

/// Decision for a failed node.
#[derive(Debug, Clone, PartialEq)]
pub enum RemediationAction {
    /// Retry with an enriched prompt after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Re-run the same node against a plan.
    Rework { attempt: u32, plan: RemediationPlan },
    /// Block the node and notify.
    Escalate {
        severity: Severity,
        reason: EscalationReason,
        message: String,
    },
}

/// Maps classified failures to actions.
#[derive(Debug, Clone)]
pub struct RemediationPolicy {
    thresholds: SeverityThresholds,
    backoff: RetryBackoff,
}

impl RemediationPolicy {
    pub fn new(thresholds: SeverityThresholds, backoff: RetryBackoff) -> Self {
        Self {
            thresholds,
            backoff,
        }
    }

    pub fn classify(&self, report: &QualityReport) -> Severity {
        classify(&report.signals, report.quality_score, &self.thresholds)
    }

    /// Decide what to do with a node that just failed.
    ///
    /// `state.retry_count` is the number of retries already spent.
    pub fn decide(
        &self,
        node: &TaskNode,
        state: &NodeState,
        report: &QualityReport,
        error: &str,
    ) -> RemediationAction {
        let severity = self.classify(report);
        if severity == Severity::Critical {
            let found = report.signals.describe();
            let message = if found.is_empty() {
                format!(
                    "{} scored {:.2}, below the critical cutoff",
                    node.id,
                    report.quality_score.unwrap_or(0.0)
                )
            } else {
                format!("{}: {}", node.id, found.join(", "))
            };
            return RemediationAction::Escalate {
                severity,
                reason: EscalationReason::CriticalFailure,
                message,
            };
        }
        if state.retries_exhausted(node.max_retries) {
            return RemediationAction::Escalate {
                severity,
                reason: EscalationReason::RetriesExhausted,
                message: format!(
                    "{} failed after {} retries",
                    node.id, state.retry_count
                ),
            };
        }

        let attempt = state.retry_count + 1;
        match severity {
            Severity::Moderate => RemediationAction::Rework {
                attempt,
                plan: RemediationPlan::build(node, report, error, severity),
            },
            _ => RemediationAction::Retry {
                attempt,
                delay: self.backoff.delay(attempt),
            },
        }
    }
}
