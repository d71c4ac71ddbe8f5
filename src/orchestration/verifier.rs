//! Quality verification of executor output.
//!
//! The scheduler never interprets executor output itself; a
//! [`QualityVerifier`] turns it into a [`QualityReport`]. `OutputVerifier`
//! understands a few plain-text markers:
//!
//! - `quality_score: 0.85` (or `score: 85%`)
//! - `issues: 3`
//! - `tests passed` / `tests failed` / `12 passed, 0 failed`
//! - `coverage: 78.5%`
//! - failure signals such as `build failed`, `compilation error`,
//!   `critical vulnerability`, `failed to start`

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::orchestration::executor::ExecutionOutcome;
use crate::orchestration::remediation::FailureSignals;

/// Score assumed for a successful run that reports none.
pub const DEFAULT_SUCCESS_SCORE: f64 = 0.85;

static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:quality[_ ]score|score)\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)\s*(%)?").unwrap()
});

static ISSUES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bissues?\s*[:=]\s*([0-9]+)").unwrap());

static TEST_COUNTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]+)\s+passed[,;]?\s+([0-9]+)\s+failed").unwrap()
});

static TESTS_FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btests?\s+(?:failed|failing)\b").unwrap());

static TESTS_PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:all\s+)?tests?\s+(?:passed|passing)\b").unwrap());

static COVERAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcoverage\s*[:=]?\s*([0-9]+(?:\.[0-9]+)?)\s*%").unwrap()
});

static BUILD_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:build failed|build failure|compilation (?:error|failed)|failed to compile|compile error)\b").unwrap()
});

static SECURITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:critical (?:security|vulnerability)|security[- ]critical|severity:\s*critical)\b").unwrap()
});

static STARTUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:failed to start|startup (?:failure|failed)|crashed on startup|could not start)\b").unwrap()
});

/// Structured reading of one executor result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub success: bool,
    pub quality_score: Option<f64>,
    pub issues: Option<u32>,
    pub tests_passed: Option<bool>,
    pub coverage: Option<f64>,
    pub signals: FailureSignals,
}

pub trait QualityVerifier: Send + Sync {
    fn verify(&self, outcome: &ExecutionOutcome) -> QualityReport;
}

/// Default verifier reading plain-text markers.
#[derive(Debug, Clone, Default)]
pub struct OutputVerifier;

impl OutputVerifier {
    pub fn new() -> Self {
        Self
    }

    fn score(text: &str) -> Option<f64> {
        let caps = SCORE_RE.captures(text)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let value = if caps.get(2).is_some() || value > 1.0 {
            value / 100.0
        } else {
            value
        };
        Some(value.clamp(0.0, 1.0))
    }

    fn tests(text: &str) -> Option<bool> {
        if let Some(caps) = TEST_COUNTS_RE.captures(text) {
            let failed: u32 = caps.get(2)?.as_str().parse().ok()?;
            return Some(failed == 0);
        }
        if TESTS_FAILED_RE.is_match(text) {
            Some(false)
        } else if TESTS_PASSED_RE.is_match(text) {
            Some(true)
        } else {
            None
        }
    }
}

impl QualityVerifier for OutputVerifier {
    fn verify(&self, outcome: &ExecutionOutcome) -> QualityReport {
        let text = outcome.output.as_str();
        let explicit = Self::score(text);
        let quality_score = match (outcome.success, explicit) {
            (_, Some(score)) => Some(score),
            (true, None) => Some(DEFAULT_SUCCESS_SCORE),
            (false, None) => None,
        };
        QualityReport {
            success: outcome.success,
            quality_score,
            issues: ISSUES_RE
                .captures(text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
            tests_passed: Self::tests(text),
            coverage: COVERAGE_RE
                .captures(text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
            signals: FailureSignals {
                build_failure: BUILD_FAILURE_RE.is_match(text),
                security_critical: SECURITY_RE.is_match(text),
                startup_failure: STARTUP_RE.is_match(text),
            },
        }
    }
}
