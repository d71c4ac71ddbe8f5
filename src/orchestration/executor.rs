//! Task executors.
//!
//! The scheduler hands each dispatched node to a [`TaskExecutor`] and only
//! looks at the success flag, the free-text output and the duration. The
//! `CommandExecutor` runs an external program (by default `claude -p`) with
//! the prompt as its last argument.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TimeoutConfig;
use crate::core::task::{NodeId, TaskNode};
use crate::error::{Error, Result};

/// One dispatch of a node to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub node_id: NodeId,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Budget the scheduler enforces for this call.
    pub timeout: Duration,
}

/// What an executor reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            duration_ms,
        }
    }

    pub fn failure(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: output.into(),
            duration_ms,
        }
    }
}

/// External collaborator that performs the work for a node.
///
/// Implementations should return promptly once `cancel` fires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;
}

/// Chooses between the default and the extended per-task timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    pub default: Duration,
    pub extended: Duration,
}

const EXTENDED_EFFORT_HOURS: f64 = 4.0;
const EXTENDED_SKILL_COUNT: usize = 4;
const EXTENDED_DESCRIPTION_CHARS: usize = 1500;
const COMPLEXITY_KEYWORDS: &[&str] = &[
    "refactor",
    "migration",
    "architecture",
    "integration",
    "security audit",
];

impl TimeoutPolicy {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            default: Duration::from_secs(config.default_secs),
            extended: Duration::from_secs(config.extended_secs),
        }
    }

    /// Heuristic: large effort, many skills, a long description, or a
    /// complexity keyword in the title or description.
    pub fn is_extended(task: &TaskNode) -> bool {
        if task.estimated_effort >= EXTENDED_EFFORT_HOURS
            || task.required_skills.len() >= EXTENDED_SKILL_COUNT
            || task.description.chars().count() > EXTENDED_DESCRIPTION_CHARS
        {
            return true;
        }
        let text = format!("{} {}", task.title, task.description).to_lowercase();
        COMPLEXITY_KEYWORDS.iter().any(|k| text.contains(k))
    }

    pub fn for_task(&self, task: &TaskNode) -> Duration {
        if Self::is_extended(task) {
            self.extended
        } else {
            self.default
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Shape of `--output-format json` responses.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    duration_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs an external program per dispatch.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Resolve `command` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorNotFound` if the program cannot be found.
    pub fn new(command: &str, args: Vec<String>) -> Result<Self> {
        let binary =
            which::which(command).map_err(|_| Error::ExecutorNotFound(command.to_string()))?;
        Ok(Self { binary, args })
    }

    /// Use a specific binary path without a `PATH` lookup.
    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Interpret a JSON response if the program produced one.
    fn parse_json(stdout: &str) -> Option<(bool, String, Option<u64>)> {
        let raw: RawResponse = serde_json::from_str(stdout.trim()).ok()?;
        let failed = raw.is_error || raw.subtype.as_deref() == Some("error") || raw.error.is_some();
        let text = if failed {
            raw.error.or(raw.result).unwrap_or_default()
        } else {
            raw.result?
        };
        Some((!failed, text, raw.duration_ms))
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        debug!(node = %request.node_id, binary = %self.binary.display(), "spawning executor");

        let child = Command::new(&self.binary)
            .args(&self.args)
            .arg(&request.prompt)
            .current_dir(&request.working_dir)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            result = child => result?,
            _ = cancel.cancelled() => {
                return Err(Error::Execution {
                    node: request.node_id.clone(),
                    reason: "cancelled".to_string(),
                });
            }
        };

        let elapsed = millis(started.elapsed());
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some((success, text, duration)) = Self::parse_json(&stdout) {
            return Ok(ExecutionOutcome {
                success,
                output: text,
                duration_ms: duration.unwrap_or(elapsed),
            });
        }

        if output.status.success() {
            Ok(ExecutionOutcome::success(stdout.trim(), elapsed))
        } else {
            let message = if stderr.trim().is_empty() {
                format!(
                    "executor exited with code {}\n{}",
                    output.status.code().unwrap_or(-1),
                    stdout.trim()
                )
            } else {
                stderr.trim().to_string()
            };
            Ok(ExecutionOutcome::failure(message, elapsed))
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;

    fn node(spec: TaskSpec) -> TaskNode {
        TaskNode::from_spec(&spec, 3)
    }

    // ========== TimeoutPolicy Tests ==========

    #[test]
    fn test_timeout_default_tier() {
        let policy = TimeoutPolicy::default();
        let task = node(TaskSpec::new("a", "Add button"));
        assert_eq!(policy.for_task(&task), Duration::from_secs(600));
    }

    #[test]
    fn test_timeout_extended_by_effort_and_skills() {
        let policy = TimeoutPolicy::default();
        let mut heavy = TaskSpec::new("a", "Big job");
        heavy.estimated_effort = 6.0;
        assert_eq!(policy.for_task(&node(heavy)), Duration::from_secs(1800));

        let broad = TaskSpec::new("b", "Wide job").with_skills(&["a", "b", "c", "d"]);
        assert!(TimeoutPolicy::is_extended(&node(broad)));
    }

    #[test]
    fn test_timeout_extended_by_keywords_and_length() {
        assert!(TimeoutPolicy::is_extended(&node(TaskSpec::new(
            "a",
            "Refactor the auth module"
        ))));
        assert!(TimeoutPolicy::is_extended(&node(
            TaskSpec::new("b", "Check").with_description("run a security audit of deps")
        )));
        let long = "x".repeat(1501);
        assert!(TimeoutPolicy::is_extended(&node(
            TaskSpec::new("c", "Long").with_description(&long)
        )));
    }

    // ========== CommandExecutor Tests ==========

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_executor_not_found() {
        let err = CommandExecutor::new("definitely-not-a-real-binary-xyz", vec![]).unwrap_err();
        assert!(matches!(err, Error::ExecutorNotFound(_)));
    }

    #[test]
    fn test_parse_json_success() {
        let json = r#"{"type":"result","subtype":"success","result":"quality_score: 0.9","duration_ms":1200}"#;
        let (success, text, duration) = CommandExecutor::parse_json(json).unwrap();
        assert!(success);
        assert_eq!(text, "quality_score: 0.9");
        assert_eq!(duration, Some(1200));
    }

    #[test]
    fn test_parse_json_error() {
        let json = r#"{"type":"result","subtype":"error","error":"Rate limit exceeded"}"#;
        let (success, text, _) = CommandExecutor::parse_json(json).unwrap();
        assert!(!success);
        assert_eq!(text, "Rate limit exceeded");
    }

    #[test]
    fn test_parse_json_rejects_plain_text() {
        assert!(CommandExecutor::parse_json("all done").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_runs_program() {
        let executor = CommandExecutor::with_binary(PathBuf::from("/bin/echo"), vec![]);
        let request = ExecutionRequest {
            node_id: "a".into(),
            prompt: "quality_score: 0.9".into(),
            working_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(5),
        };
        let outcome = executor
            .execute(&request, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "quality_score: 0.9");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_reports_failure() {
        let executor = CommandExecutor::with_binary(PathBuf::from("/bin/sh"), vec!["-c".into()]);
        let request = ExecutionRequest {
            node_id: "a".into(),
            prompt: "echo build failed >&2; exit 3".into(),
            working_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(5),
        };
        let outcome = executor
            .execute(&request, CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.output, "build failed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_cancellation() {
        let executor = CommandExecutor::with_binary(PathBuf::from("/bin/sh"), vec!["-c".into()]);
        let request = ExecutionRequest {
            node_id: "a".into(),
            prompt: "sleep 30".into(),
            working_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor.execute(&request, cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
