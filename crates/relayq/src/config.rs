use std::time::Duration;

use serde::{Deserialize, Serialize};

use relayq_core::{EffectiveOptions, Error, Result};

/// Engine configuration.
///
/// Durations are plain second/millisecond integers so the struct
/// round-trips through config files; typed accessors are below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Broker URL; the scheme selects the driver (`memory://` built in).
    pub broker_url: String,

    /// Additional retries after the first failed attempt.
    pub max_retries: u32,

    /// Backoff table in seconds.
    pub retry_intervals_secs: Vec<u64>,

    /// Per-attempt deadline in seconds.
    pub timeout_secs: u64,

    /// Lifetime of terminal task records in seconds.
    pub ttl_secs: u64,

    /// Blocking consume slice in milliseconds; bounds shutdown latency.
    pub poll_timeout_ms: u64,

    /// Back-off after a failed consume, in milliseconds.
    pub error_backoff_ms: u64,

    /// Delayed-task promoter tick in milliseconds.
    pub promote_interval_ms: u64,

    /// Drain time granted on top of the largest queue timeout at shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            broker_url: "memory://".to_string(),
            max_retries: 3,
            retry_intervals_secs: vec![60, 120, 180],
            timeout_secs: 180,
            ttl_secs: 180,
            poll_timeout_ms: 1000,
            error_backoff_ms: 1000,
            promote_interval_ms: 1000,
            shutdown_grace_secs: 5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path, e)))?;
        let config: EngineConfig = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            return Err(Error::Config("poll_timeout_ms must be positive".to_string()));
        }
        if self.promote_interval_ms == 0 {
            return Err(Error::Config(
                "promote_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine-level execution defaults, the base of the option layering.
    pub fn defaults(&self) -> EffectiveOptions {
        EffectiveOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            retry_intervals: self
                .retry_intervals_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            ttl: Duration::from_secs(self.ttl_secs),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
