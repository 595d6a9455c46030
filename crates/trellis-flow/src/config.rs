use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use trellis_core::TrellisError;

/// Timing of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between probe invocations
    pub interval: Duration,
    /// Age after which probes escalate conditions that should resolve quickly
    pub severe_threshold: Duration,
    /// Overall deadline
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            severe_threshold: Duration::from_secs(30),
            timeout: Duration::from_secs(180),
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, severe_threshold: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            severe_threshold,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TrellisError> {
        if self.interval.is_zero() {
            return Err(TrellisError::invalid_config(
                "poll interval must be greater than zero",
                "Set interval_seconds to at least 1",
            ));
        }
        if self.severe_threshold >= self.timeout {
            return Err(TrellisError::invalid_config(
                format!(
                    "severe threshold {:?} is not below timeout {:?}",
                    self.severe_threshold, self.timeout
                ),
                "The severe threshold only makes sense when it is shorter than the timeout",
            ));
        }
        Ok(())
    }
}

/// Serialized form of [`PollConfig`] as found in the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_seconds: u64,
    pub severe_threshold_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollConfig::default().into()
    }
}

impl From<PollSettings> for PollConfig {
    fn from(settings: PollSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_seconds),
            severe_threshold: Duration::from_secs(settings.severe_threshold_seconds),
            timeout: Duration::from_secs(settings.timeout_seconds),
        }
    }
}

impl From<PollConfig> for PollSettings {
    fn from(config: PollConfig) -> Self {
        Self {
            interval_seconds: config.interval.as_secs(),
            severe_threshold_seconds: config.severe_threshold.as_secs(),
            timeout_seconds: config.timeout.as_secs(),
        }
    }
}

/// Poll timing per managed resource kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Used for every kind without an override
    pub default: PollSettings,
    /// Overrides keyed by kind, e.g. `Infrastructure` or `Etcd`
    pub per_kind: BTreeMap<String, PollSettings>,
}

impl TimeoutConfig {
    /// Poll timing for a kind
    pub fn resolve(&self, kind: &str) -> PollConfig {
        self.per_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default)
            .into()
    }

    pub fn with_override(mut self, kind: impl Into<String>, config: PollConfig) -> Self {
        self.per_kind.insert(kind.into(), config.into());
        self
    }

    pub fn validate(&self) -> Result<(), TrellisError> {
        PollConfig::from(self.default).validate()?;
        for (kind, settings) in &self.per_kind {
            PollConfig::from(*settings).validate().map_err(|e| {
                TrellisError::invalid_config(
                    format!("timeouts for {}: {}", kind, e),
                    "Fix the per_kind override in the configuration file",
                )
            })?;
        }
        Ok(())
    }
}
