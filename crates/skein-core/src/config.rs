use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeinError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SkeinError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SkeinError::Config(e.to_string()))
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base_delay * (attempt + 1)`
    Linear,
    /// `base_delay * 2^attempt`
    #[default]
    Exponential,
}

/// Retry configuration for tool and node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Substrings that mark an error as transient. Anything else is
    /// terminal on first failure.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_retryable_errors() -> Vec<String> {
    vec![
        "timeout".into(),
        "timed out".into(),
        "connection".into(),
        "temporarily unavailable".into(),
        "rate limit".into(),
        "502".into(),
        "503".into(),
    ]
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a half-open trial.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Breakers open longer than this are force-closed by the sweep.
    #[serde(default = "default_force_close_secs")]
    pub force_close_secs: u64,
    /// Cron expression for the sweep (default: top of every hour).
    #[serde(default = "default_sweep_schedule")]
    pub sweep_schedule: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            force_close_secs: default_force_close_secs(),
            sweep_schedule: default_sweep_schedule(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_force_close_secs() -> u64 {
    3600
}
fn default_sweep_schedule() -> String {
    "0 0 * * * *".to_string()
}

/// Per-run defaults, overridable by a definition's execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Wall-clock limit for one run.
    #[serde(default = "default_run_timeout")]
    pub timeout_secs: u64,
    /// Hard cap on loop-node iterations.
    #[serde(default = "default_loop_iterations")]
    pub max_loop_iterations: u32,
    /// How long a human-input node waits before resolving the timeout path.
    #[serde(default = "default_human_input_timeout")]
    pub human_input_timeout_secs: u64,
    /// Broadcast channel capacity for the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_run_timeout(),
            max_loop_iterations: default_loop_iterations(),
            human_input_timeout_secs: default_human_input_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_run_timeout() -> u64 {
    600
}
fn default_loop_iterations() -> u32 {
    100
}
fn default_human_input_timeout() -> u64 {
    300
}
fn default_event_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.backoff, BackoffKind::Exponential);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 60);
        assert_eq!(config.breaker.force_close_secs, 3600);
        assert_eq!(config.run.max_loop_iterations, 100);
    }

    #[test]
    fn load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[retry]
max_retries = 5
backoff = "linear"

[breaker]
failure_threshold = 2
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff, BackoffKind::Linear);
        // Unspecified fields fall back to defaults
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.cooldown_secs, 60);
    }

    #[test]
    fn load_missing_file() {
        let result = EngineConfig::load("/nonexistent/skein.toml");
        assert!(matches!(result, Err(SkeinError::ConfigNotFound(_))));
    }
}
