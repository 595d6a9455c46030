use crate::controller::ShootControllerConfig;
use crate::hibernation::HibernationConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use trellis_core::{Result, TrellisError};
use trellis_flow::TimeoutConfig;

/// Top-level configuration file
///
/// Every section is optional; missing values fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub controller: ControllerSettings,
    pub hibernation: HibernationSettings,
    /// Poll timing per managed kind, plus `CredentialAdoption`
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub sync_interval_seconds: u64,
    pub max_concurrent_reconciles: usize,
    pub reconcile_timeout_seconds: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 30,
            max_concurrent_reconciles: 5,
            reconcile_timeout_seconds: 15 * 60,
        }
    }
}

impl From<ControllerSettings> for ShootControllerConfig {
    fn from(settings: ControllerSettings) -> Self {
        Self {
            sync_interval: Duration::from_secs(settings.sync_interval_seconds),
            max_concurrent_reconciles: settings.max_concurrent_reconciles,
            reconcile_timeout: Duration::from_secs(settings.reconcile_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HibernationSettings {
    pub node_wait_seconds: u64,
    pub pod_wait_seconds: u64,
    pub endpoint_wait_seconds: u64,
    pub poll_interval_seconds: u64,
}

impl Default for HibernationSettings {
    fn default() -> Self {
        Self {
            node_wait_seconds: 10 * 60,
            pod_wait_seconds: 5 * 60,
            endpoint_wait_seconds: 2 * 60,
            poll_interval_seconds: 5,
        }
    }
}

impl From<HibernationSettings> for HibernationConfig {
    fn from(settings: HibernationSettings) -> Self {
        Self {
            node_wait: Duration::from_secs(settings.node_wait_seconds),
            pod_wait: Duration::from_secs(settings.pod_wait_seconds),
            endpoint_wait: Duration::from_secs(settings.endpoint_wait_seconds),
            poll_interval: Duration::from_secs(settings.poll_interval_seconds),
        }
    }
}

impl TrellisConfig {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            TrellisError::invalid_config(
                format!("Failed to read {}: {}", path.display(), e),
                "Check the path passed with --config",
            )
        })?;
        let config = Self::parse(&data)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let config: Self = trellis_core::from_yaml(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.sync_interval_seconds == 0 {
            return Err(TrellisError::invalid_config(
                "controller.sync_interval_seconds must be greater than zero",
                "Shoots are resynced on this interval; 30 seconds is a reasonable value",
            ));
        }
        if self.controller.max_concurrent_reconciles == 0 {
            return Err(TrellisError::invalid_config(
                "controller.max_concurrent_reconciles must be greater than zero",
                "Allow at least one shoot to be reconciled at a time",
            ));
        }
        if self.controller.reconcile_timeout_seconds == 0 {
            return Err(TrellisError::invalid_config(
                "controller.reconcile_timeout_seconds must be greater than zero",
                "Every pass is cancelled after this long; 900 seconds is the default",
            ));
        }
        if self.hibernation.poll_interval_seconds == 0 {
            return Err(TrellisError::invalid_config(
                "hibernation.poll_interval_seconds must be greater than zero",
                "Set poll_interval_seconds to at least 1",
            ));
        }
        self.timeouts.validate()
    }

    pub fn controller(&self) -> ShootControllerConfig {
        self.controller.into()
    }

    pub fn hibernation(&self) -> HibernationConfig {
        self.hibernation.into()
    }
}
