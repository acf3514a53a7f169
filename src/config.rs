//! Engine policy configuration.
//!
//! [`EngineConfig`] is what the engine consumes. Conflict and failure policy
//! have no defaults and must be chosen by the caller. [`EngineSettings`] is
//! the file/environment shape, loaded through the `config` crate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "TAPPS_EPIC";

/// What to do when stories in the same wave declare overlapping files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the run before dispatching the wave.
    Abort,
    /// Run conflicting stories one after another, others in parallel.
    Serialize,
    /// Run everything in parallel and log a warning.
    Proceed,
}

impl ConflictPolicy {
    pub fn as_label(self) -> &'static str {
        match self {
            ConflictPolicy::Abort => "abort",
            ConflictPolicy::Serialize => "serialize",
            ConflictPolicy::Proceed => "proceed",
        }
    }
}

/// What a story failure does to the rest of the epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail-fast: in-flight siblings finish, nothing new is dispatched.
    HaltEpic,
    /// Skip the failed story's dependents and keep running unrelated branches.
    SkipDependents,
}

impl FailurePolicy {
    pub fn as_label(self) -> &'static str {
        match self {
            FailurePolicy::HaltEpic => "halt_epic",
            FailurePolicy::SkipDependents => "skip_dependents",
        }
    }
}

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(retry)
    }
}

/// Runtime configuration for an epic run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub conflict_policy: ConflictPolicy,
    pub failure_policy: FailurePolicy,
    /// Maximum stories executing at once within a wave.
    pub max_concurrency: usize,
    /// Per-story execution budget.
    pub story_timeout: Duration,
    /// Minimum quality score for a story to count as a success.
    pub quality_threshold: Option<f64>,
    /// Retries for transient executor errors and timeouts.
    pub story_retry: RetryPolicy,
    /// Retries for state writes. Exhaustion is fatal.
    pub storage_retry: RetryPolicy,
    /// Cumulative failures that halt a `skip_dependents` run.
    pub circuit_breaker_threshold: Option<u32>,
    /// Whether to write the per-run event journal.
    pub journal: bool,
}

impl EngineConfig {
    pub fn new(conflict_policy: ConflictPolicy, failure_policy: FailurePolicy) -> Self {
        Self {
            conflict_policy,
            failure_policy,
            max_concurrency: 3,
            story_timeout: Duration::from_secs(600),
            quality_threshold: None,
            story_retry: RetryPolicy::new(0, Duration::from_secs(2)),
            storage_retry: RetryPolicy::new(2, Duration::from_millis(100)),
            circuit_breaker_threshold: None,
            journal: true,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_story_timeout(mut self, timeout: Duration) -> Self {
        self.story_timeout = timeout;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    pub fn with_story_retry(mut self, retry: RetryPolicy) -> Self {
        self.story_retry = retry;
        self
    }

    pub fn with_storage_retry(mut self, retry: RetryPolicy) -> Self {
        self.storage_retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = Some(threshold);
        self
    }

    pub fn with_journal(mut self, enabled: bool) -> Self {
        self.journal = enabled;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.story_timeout.is_zero() {
            return Err(EngineError::Config(
                "story_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(threshold) = self.quality_threshold {
            if !threshold.is_finite() {
                return Err(EngineError::Config(format!(
                    "quality_threshold must be finite, got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

/// Settings as read from a TOML file and `TAPPS_EPIC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub conflict_policy: ConflictPolicy,
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_story_timeout_secs")]
    pub story_timeout_secs: u64,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
    #[serde(default)]
    pub story_retries: u32,
    #[serde(default = "default_story_retry_backoff_ms")]
    pub story_retry_backoff_ms: u64,
    #[serde(default = "default_storage_write_attempts")]
    pub storage_write_attempts: u32,
    #[serde(default = "default_storage_retry_backoff_ms")]
    pub storage_retry_backoff_ms: u64,
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,
    #[serde(default = "default_journal")]
    pub journal: bool,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_story_timeout_secs() -> u64 {
    600
}

fn default_story_retry_backoff_ms() -> u64 {
    2_000
}

fn default_storage_write_attempts() -> u32 {
    3
}

fn default_storage_retry_backoff_ms() -> u64 {
    100
}

fn default_journal() -> bool {
    true
}

impl EngineSettings {
    /// Load from an optional TOML file, then apply environment overrides
    /// such as `TAPPS_EPIC_MAX_CONCURRENCY=4`.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parse settings from TOML text, without environment overrides.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn into_config(self) -> EngineResult<EngineConfig> {
        if self.storage_write_attempts == 0 {
            return Err(EngineError::Config(
                "storage_write_attempts must be at least 1".to_string(),
            ));
        }
        let config = EngineConfig {
            conflict_policy: self.conflict_policy,
            failure_policy: self.failure_policy,
            max_concurrency: self.max_concurrency,
            story_timeout: Duration::from_secs(self.story_timeout_secs),
            quality_threshold: self.quality_threshold,
            story_retry: RetryPolicy::new(
                self.story_retries,
                Duration::from_millis(self.story_retry_backoff_ms),
            ),
            storage_retry: RetryPolicy::new(
                self.storage_write_attempts - 1,
                Duration::from_millis(self.storage_retry_backoff_ms),
            ),
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            journal: self.journal,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<EngineSettings> for EngineConfig {
    type Error = EngineError;

    fn try_from(settings: EngineSettings) -> EngineResult<Self> {
        settings.into_config()
    }
}
