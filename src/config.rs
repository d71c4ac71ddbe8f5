use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Score cutoffs used by failure classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    /// Scores below this are critical.
    pub critical_below: f64,
    /// Scores below this (and at or above `critical_below`) are moderate.
    pub moderate_below: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical_below: 0.3,
            moderate_below: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    pub extended_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 600,
            extended_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 60_000,
        }
    }
}

/// Tunables consumed by the orchestration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_parallelism: usize,
    pub quality_threshold: f64,
    pub max_retries: u32,
    pub max_cyclical_iterations: u32,
    pub checkpoint_retention: usize,
    pub severity: SeverityThresholds,
    pub timeouts: TimeoutConfig,
    pub poll_interval_ms: u64,
    /// Ceiling on run-loop passes that change state (dispatch, completion,
    /// recovery). Idle polls while work is in flight are not counted.
    pub max_loop_iterations: u64,
    /// Completions between automatic snapshots.
    pub snapshot_every: u32,
    pub backoff: BackoffConfig,
    pub event_buffer: usize,
    /// Whether a completed-with-warning node satisfies quality gates.
    pub warnings_pass_quality_gates: bool,
    pub general_sub_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 3,
            quality_threshold: 0.7,
            max_retries: 3,
            max_cyclical_iterations: 5,
            checkpoint_retention: 10,
            severity: SeverityThresholds::default(),
            timeouts: TimeoutConfig::default(),
            poll_interval_ms: 250,
            max_loop_iterations: 100_000,
            snapshot_every: 5,
            backoff: BackoffConfig::default(),
            event_buffer: 256,
            warnings_pass_quality_gates: true,
            general_sub_iterations: 3,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if self.max_parallelism == 0 {
            return Err(Error::Validation("max_parallelism must be at least 1".into()));
        }
        if !unit.contains(&self.quality_threshold) {
            return Err(Error::Validation(format!(
                "quality_threshold {} outside [0, 1]",
                self.quality_threshold
            )));
        }
        if !unit.contains(&self.severity.critical_below)
            || !unit.contains(&self.severity.moderate_below)
            || self.severity.critical_below > self.severity.moderate_below
        {
            return Err(Error::Validation(format!(
                "severity cutoffs {} / {} must satisfy 0 <= critical <= moderate <= 1",
                self.severity.critical_below, self.severity.moderate_below
            )));
        }
        if self.checkpoint_retention == 0 {
            return Err(Error::Validation(
                "checkpoint_retention must be at least 1".into(),
            ));
        }
        if self.timeouts.default_secs == 0 || self.timeouts.extended_secs < self.timeouts.default_secs
        {
            return Err(Error::Validation(
                "timeouts must be non-zero and extended >= default".into(),
            ));
        }
        if self.max_loop_iterations == 0 || self.event_buffer == 0 {
            return Err(Error::Validation(
                "max_loop_iterations and event_buffer must be non-zero".into(),
            ));
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(Error::Validation("backoff base exceeds max".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Executor program, e.g. `claude`.
    pub command: Option<String>,
    /// Extra arguments placed before the prompt.
    pub args: Option<Vec<String>>,
    /// Persistence root for checkpoints.
    pub store_dir: Option<String>,
}

impl Config {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn effective_args(&self) -> Vec<String> {
        self.args.clone().unwrap_or_else(|| vec!["-p".to_string()])
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadence_dir()?.join("projects")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.engine.validate()?;
        debug!(
            command = ?config.command,
            max_parallelism = config.engine.max_parallelism,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::cadence_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [Self::cadence_dir()?, self.store_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
