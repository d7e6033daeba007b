//! Hub configuration.
//!
//! Every field has a serde default except
//! [`PipelineConfig::idempotency_key_mode`], which must be chosen explicitly.

use crate::core::StageName;
use crate::errors::{ConfigurationError, HubResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How stage inputs are compared when deciding whether a re-run may be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyKeyMode {
    /// Inputs must be byte-identical.
    ExactBytes,
    /// Inputs are compared after normalising line endings, comments and whitespace.
    Semantic,
}

impl fmt::Display for IdempotencyKeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactBytes => write!(f, "exact_bytes"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

impl FromStr for IdempotencyKeyMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact_bytes" | "exact" => Ok(Self::ExactBytes),
            "semantic" => Ok(Self::Semantic),
            other => Err(ConfigurationError::new(format!(
                "unknown idempotency key mode '{other}' (expected exact_bytes or semantic)"
            ))),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Directory holding one workspace per project.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// External command per stage.
    #[serde(default)]
    pub tools: HashMap<StageName, ProcessToolConfig>,
    /// Tokens accepted by the bundled authenticator.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/workspace")
}

impl HubConfig {
    /// Creates a configuration with defaults for everything but the
    /// workspace root and idempotency key mode.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>, mode: IdempotencyKeyMode) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            pipeline: PipelineConfig::new(mode),
            session: SessionConfig::default(),
            tools: HashMap::new(),
            auth_tokens: Vec::new(),
        }
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> HubResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::new(format!("invalid hub configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Adds an accepted auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_tokens.push(token.into());
        self
    }

    /// Sets the external command for a stage.
    #[must_use]
    pub fn with_tool(mut self, stage: StageName, tool: ProcessToolConfig) -> Self {
        self.tools.insert(stage, tool);
        self
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.pipeline.max_concurrent_stages == 0 {
            return Err(ConfigurationError::new(
                "pipeline.max_concurrent_stages must be at least 1",
            ));
        }
        if self.pipeline.backoff_multiplier < 1.0 || self.session.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::new("backoff_multiplier must be >= 1.0"));
        }
        if self.session.health_failure_threshold == 0 {
            return Err(ConfigurationError::new(
                "session.health_failure_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Pipeline orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries for transient stage failures.
    #[serde(default = "default_pipeline_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Backoff multiplier between retries.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Default per-stage deadline.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Per-stage deadline overrides.
    #[serde(default)]
    pub stage_timeouts: HashMap<StageName, u64>,
    /// Maximum stages running at once within a run.
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,
    /// Input comparison used for idempotent skips.
    pub idempotency_key_mode: IdempotencyKeyMode,
}

fn default_pipeline_max_retries() -> u32 {
    1
}

fn default_retry_initial_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_max_concurrent_stages() -> usize {
    4
}

impl PipelineConfig {
    /// Creates pipeline settings with the given key mode and defaults elsewhere.
    #[must_use]
    pub fn new(idempotency_key_mode: IdempotencyKeyMode) -> Self {
        Self {
            max_retries: default_pipeline_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            stage_timeout_secs: default_stage_timeout_secs(),
            stage_timeouts: HashMap::new(),
            max_concurrent_stages: default_max_concurrent_stages(),
            idempotency_key_mode,
        }
    }

    /// Deadline for `stage`.
    #[must_use]
    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        let secs = self
            .stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.stage_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Retry policy for transient stage failures.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
    }
}

/// Editing session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Provisioning retries.
    #[serde(default = "default_session_max_retries")]
    pub max_retries: u32,
    /// Delay before the first provisioning retry.
    #[serde(default = "default_session_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff multiplier between provisioning retries.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive failed health checks before a session is Degraded.
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
    /// Interval of the background health monitor.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Session lifetime.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Host of the IDE server.
    #[serde(default = "default_ide_host")]
    pub ide_host: String,
    /// Port of the IDE server.
    #[serde(default = "default_ide_port")]
    pub ide_port: u16,
    /// Liveness path on the IDE server.
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,
}

fn default_session_max_retries() -> u32 {
    3
}

fn default_session_initial_delay_ms() -> u64 {
    500
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_ide_host() -> String {
    "localhost".to_string()
}

fn default_ide_port() -> u16 {
    3000
}

fn default_liveness_path() -> String {
    "/healthz".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_session_max_retries(),
            initial_delay_ms: default_session_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            health_failure_threshold: default_health_failure_threshold(),
            health_check_interval_secs: default_health_check_interval_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            ide_host: default_ide_host(),
            ide_port: default_ide_port(),
            liveness_path: default_liveness_path(),
        }
    }
}

impl SessionConfig {
    /// Retry policy for provisioning.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
    }

    /// Session lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Health monitor interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// External command implementing a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessToolConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Version string mixed into the idempotency key.
    #[serde(default)]
    pub version: Option<String>,
}

impl ProcessToolConfig {
    /// Creates a tool config for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            version: None,
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
