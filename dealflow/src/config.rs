use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;

/// Configuration for a pipeline deployment.
///
/// Every field has a default, so a config file only needs to name what it
/// overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Budget for the rate-governed upstream data API.
    pub rate_limit: RateLimitConfig,
    /// Default retry policy for stages that do not declare their own.
    pub retry: RetryPolicy,
    /// Default per-attempt timeout in milliseconds.
    pub stage_timeout_ms: u64,
    /// Lifetime of a run's shared context in seconds.
    pub context_ttl_secs: u64,
    /// Buffer size of the in-process event bus.
    pub event_capacity: usize,
    pub orchestrator: OrchestratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            stage_timeout_ms: 30_000,
            context_ttl_secs: 3600,
            event_capacity: 1024,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Run-level knobs for the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Whole-run deadline in milliseconds; reaching it cancels the run.
    pub run_timeout_ms: Option<u64>,
    /// How long cancelled stages get to wind down before they are aborted.
    pub cancel_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: None,
            cancel_grace_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    /// Wall-clock limit for a whole run, if configured.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// How long stages get to observe cancellation before being aborted.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON config.
    ///
    /// Missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("invalid pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config from `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or [`validate`](Self::validate) rejects it.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Reject budgets no run could satisfy.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit.max_calls == 0 {
            bail!("rate_limit.max_calls must be at least 1");
        }
        if self.rate_limit.window_ms == 0 {
            bail!("rate_limit.window_ms must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.stage_timeout_ms == 0 {
            bail!("stage_timeout_ms must be positive");
        }
        if self.context_ttl_secs == 0 {
            bail!("context_ttl_secs must be positive");
        }
        Ok(())
    }

    /// Default per-attempt timeout as a [`Duration`].
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn context_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.context_ttl_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.context_ttl(), chrono::Duration::hours(1));
        assert_eq!(config.rate_limit.max_calls, 5);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{"rate_limit": {"max_calls": 30}, "orchestrator": {"run_timeout_ms": 600000}}"#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_calls, 30);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.orchestrator.run_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.orchestrator.cancel_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let err = PipelineConfig::from_json_str(
            r#"{"retry": {"max_attempts": 3, "base_delay_ms": 5000, "max_delay_ms": 100}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_rejects_zero_budget() {
        let mut config = PipelineConfig::default();
        config.rate_limit.max_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"stage_timeout_ms": 1500}}"#).unwrap();
        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.stage_timeout(), Duration::from_millis(1500));

        let missing = PipelineConfig::from_json_file("/nonexistent/dealflow.json");
        assert!(missing.is_err());
    }
}
