//! Typed router configuration
//!
//! Every tunable (weights, thresholds, cooldowns, retry budgets) is a named field
//! with a documented default. Configuration is validated once at load time; the
//! components assume a validated config.

use crate::registry::Agent;
use crate::routing::scoring::ScoringWeights;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Agents registered at startup
    #[serde(default)]
    pub agents: Vec<Agent>,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Instance name used in logs and probe responses
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Port of the health/metrics probe server
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_service_name() -> String {
    "betty-router".to_string()
}

fn default_health_port() -> u16 {
    8080
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            health_port: default_health_port(),
        }
    }
}

/// Selection engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionConfig {
    /// Maximum length of the fallback chain returned with a selection
    #[serde(default = "default_max_fallbacks")]
    pub max_fallbacks: usize,
    /// A preferred agent wins if its score is within this fraction of the top score
    #[serde(default = "default_preference_tolerance")]
    pub preference_tolerance: f64,
    /// Cost at which the cost sub-score is 0.5
    #[serde(default = "default_cost_reference_cents")]
    pub cost_reference_cents: u64,
    /// Weights used until the learning engine publishes its own
    #[serde(default)]
    pub baseline_weights: ScoringWeights,
    /// Blend learned success predictions into the reliability sub-score
    #[serde(default = "default_true")]
    pub use_predictions: bool,
}

fn default_max_fallbacks() -> usize {
    3
}

fn default_preference_tolerance() -> f64 {
    0.05
}

fn default_cost_reference_cents() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_fallbacks: default_max_fallbacks(),
            preference_tolerance: default_preference_tolerance(),
            cost_reference_cents: default_cost_reference_cents(),
            baseline_weights: ScoringWeights::default(),
            use_predictions: true,
        }
    }
}

/// Circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within the trailing window that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Number of most recent attempts considered
    #[serde(default = "default_breaker_window")]
    pub window_size: u32,
    /// Time an open breaker waits before allowing a probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_window() -> u32 {
    10
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_size: default_breaker_window(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Maximum outcomes kept per agent for sampling
    #[serde(default = "default_health_window")]
    pub window_size: usize,
    /// Maximum age of outcomes considered by a sample
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
    /// p95 latency above this counts as overshoot
    #[serde(default = "default_latency_target_ms")]
    pub latency_target_ms: u64,
    /// Cadence of the background `monitor_all` job
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
}

fn default_health_window() -> usize {
    100
}

fn default_window_minutes() -> u64 {
    15
}

fn default_latency_target_ms() -> u64 {
    5_000
}

fn default_sample_interval_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: default_health_window(),
            window_minutes: default_window_minutes(),
            latency_target_ms: default_latency_target_ms(),
            sample_interval_secs: default_sample_interval_secs(),
        }
    }
}

impl HealthConfig {
    pub fn window_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes as i64)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

/// Learning engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningConfig {
    /// Samples needed before a narrower aggregation level is trusted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Cadence of the background weight recomputation
    #[serde(default = "default_recompute_interval_secs")]
    pub recompute_interval_secs: u64,
    /// Cadence at which queued outcomes are folded into the aggregates
    #[serde(default = "default_ingest_interval_ms")]
    pub ingest_interval_ms: u64,
    /// Recent outcomes kept for weight recomputation
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Step size of the ratio adjustment
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
}

fn default_min_samples() -> usize {
    10
}

fn default_recompute_interval_secs() -> u64 {
    300
}

fn default_ingest_interval_ms() -> u64 {
    1_000
}

fn default_history_size() -> usize {
    1_000
}

fn default_learning_rate() -> f64 {
    0.5
}

fn default_min_weight() -> f64 {
    0.05
}

fn default_max_weight() -> f64 {
    0.6
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            recompute_interval_secs: default_recompute_interval_secs(),
            ingest_interval_ms: default_ingest_interval_ms(),
            history_size: default_history_size(),
            learning_rate: default_learning_rate(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
        }
    }
}

impl LearningConfig {
    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.recompute_interval_secs)
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }
}

/// Orchestrator retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Executed dispatch attempts per route call, primary included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Exponential backoff before attempt `attempt` (0-based), capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

/// Outcome recorder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecorderConfig {
    /// Correlation ids remembered for deduplication
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
    /// Outcomes buffered while the store is unavailable
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    /// Cadence of the background flush of buffered outcomes
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Append retries per outcome within one flush
    #[serde(default = "default_flush_retries")]
    pub flush_retries: u32,
}

fn default_dedupe_capacity() -> usize {
    10_000
}

fn default_pending_capacity() -> usize {
    50_000
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_flush_retries() -> u32 {
    3
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            dedupe_capacity: default_dedupe_capacity(),
            pending_capacity: default_pending_capacity(),
            flush_interval_secs: default_flush_interval_secs(),
            flush_retries: default_flush_retries(),
        }
    }
}

impl RecorderConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Which store backs persistence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory holding the JSON-lines files
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Persisted health snapshots older than this are dropped on compaction
    #[serde(default = "default_snapshot_retention_hours")]
    pub snapshot_retention_hours: u64,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_snapshot_retention_hours() -> u64 {
    168
}

impl StorageConfig {
    pub fn snapshot_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.snapshot_retention_hours as i64)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            snapshot_retention_hours: default_snapshot_retention_hours(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

impl RouterConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every range constraint the components rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breaker = &self.circuit_breaker;
        if breaker.window_size == 0 {
            return Err(invalid("circuit_breaker.window_size must be at least 1"));
        }
        if breaker.failure_threshold == 0 || breaker.failure_threshold > breaker.window_size {
            return Err(invalid(format!(
                "circuit_breaker.failure_threshold must be in 1..={}",
                breaker.window_size
            )));
        }
        if breaker.cooldown_secs == 0 || breaker.cooldown_secs > 86_400 {
            return Err(invalid("circuit_breaker.cooldown_secs must be in 1..=86400"));
        }

        let selection = &self.selection;
        if !(0.0..1.0).contains(&selection.preference_tolerance) {
            return Err(invalid("selection.preference_tolerance must be in [0, 1)"));
        }
        if selection.cost_reference_cents == 0 {
            return Err(invalid("selection.cost_reference_cents must be positive"));
        }
        selection
            .baseline_weights
            .validate()
            .map_err(|e| invalid(format!("selection.baseline_weights: {e}")))?;

        let health = &self.health;
        if health.window_size == 0 {
            return Err(invalid("health.window_size must be at least 1"));
        }
        if health.window_minutes == 0 || health.window_minutes > 10_080 {
            return Err(invalid("health.window_minutes must be in 1..=10080"));
        }
        if health.latency_target_ms == 0 {
            return Err(invalid("health.latency_target_ms must be positive"));
        }
        if health.sample_interval_secs == 0 {
            return Err(invalid("health.sample_interval_secs must be positive"));
        }

        let learning = &self.learning;
        if learning.min_samples == 0 {
            return Err(invalid("learning.min_samples must be at least 1"));
        }
        if learning.recompute_interval_secs == 0 {
            return Err(invalid("learning.recompute_interval_secs must be positive"));
        }
        if learning.ingest_interval_ms == 0 {
            return Err(invalid("learning.ingest_interval_ms must be positive"));
        }
        if learning.history_size == 0 {
            return Err(invalid("learning.history_size must be at least 1"));
        }
        if !(learning.learning_rate > 0.0 && learning.learning_rate <= 1.0) {
            return Err(invalid("learning.learning_rate must be in (0, 1]"));
        }
        if !(learning.min_weight > 0.0 && learning.min_weight < learning.max_weight) {
            return Err(invalid(
                "learning.min_weight must be positive and below learning.max_weight",
            ));
        }
        // Four dimensions must be able to sum to 1.0 inside the bounds
        if learning.min_weight * 4.0 > 1.0 || learning.max_weight * 4.0 < 1.0 {
            return Err(invalid(
                "learning weight bounds must admit a vector summing to 1.0",
            ));
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.max_attempts == 0 {
            return Err(invalid("orchestrator.max_attempts must be at least 1"));
        }
        if orchestrator.backoff_base_ms > orchestrator.backoff_max_ms {
            return Err(invalid(
                "orchestrator.backoff_base_ms must not exceed orchestrator.backoff_max_ms",
            ));
        }

        let recorder = &self.recorder;
        if recorder.dedupe_capacity == 0 || recorder.pending_capacity == 0 {
            return Err(invalid("recorder capacities must be at least 1"));
        }
        if recorder.flush_interval_secs == 0 {
            return Err(invalid("recorder.flush_interval_secs must be positive"));
        }
        if self.storage.snapshot_retention_hours == 0 {
            return Err(invalid("storage.snapshot_retention_hours must be positive"));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            validate_agent_id(&agent.id)?;
            if !seen.insert(agent.id.as_str()) {
                return Err(invalid(format!("duplicate agent id '{}'", agent.id)));
            }
            if agent.capacity == 0 {
                return Err(invalid(format!(
                    "agent '{}' must declare a capacity of at least 1",
                    agent.id
                )));
            }
        }

        Ok(())
    }

    /// Configuration used by unit tests: in-memory storage, default policy
    pub fn test_config() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..StorageConfig::default()
            },
            ..Default::default()
        }
    }
}

/// Agent ids must match [a-zA-Z0-9._-]+
pub fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
