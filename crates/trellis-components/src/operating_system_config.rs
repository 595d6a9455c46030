use crate::component::Component;
use crate::extension::Extension;
use crate::managed::ComponentContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use trellis_core::{ObjectKey, StoredObject, WorkerPool};
use trellis_flow::{CancellationToken, FlowError, Result};
use trellis_storage::PriorState;

/// Reference to the rendered cloud-config of a worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfigRef {
    pub secret_name: String,
    pub checksum: Option<String>,
}

/// Boot configuration of the machines of one worker pool
///
/// Waiting extracts the cloud-config reference the operator rendered, which
/// the worker component then hands to the machines.
pub struct OperatingSystemConfig {
    pool: String,
    extension: Extension,
    cloud_config: Mutex<Option<CloudConfigRef>>,
}

impl OperatingSystemConfig {
    pub fn new(
        ctx: &ComponentContext,
        namespace: &str,
        pool: &WorkerPool,
        kubernetes_version: &str,
    ) -> Self {
        let extension = Extension::new(
            ctx,
            "OperatingSystemConfig",
            namespace,
            &format!("osc-{}", pool.name),
            json!({
                "purpose": "provision",
                "pool": pool.name,
                "machineType": pool.machine_type,
                "kubeletVersion": kubernetes_version,
            }),
        );
        Self {
            pool: pool.name.clone(),
            extension,
            cloud_config: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn key(&self) -> &ObjectKey {
        self.extension.key()
    }

    /// Reference captured by the last successful wait
    pub fn cloud_config(&self) -> Option<CloudConfigRef> {
        self.cloud_config.lock().clone()
    }
}

fn extract_cloud_config(object: &StoredObject) -> Result<CloudConfigRef> {
    let reference = object
        .status
        .provider_status
        .as_ref()
        .and_then(|status| status.get("cloudConfig"))
        .ok_or_else(|| {
            FlowError::severe(
                format!("wait for {}", object.key),
                "no cloud config information provided in status",
            )
        })?;

    let secret_name = reference
        .pointer("/secretRef/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            FlowError::severe(
                format!("wait for {}", object.key),
                "cloud config status carries no secret reference",
            )
        })?;

    Ok(CloudConfigRef {
        secret_name: secret_name.to_string(),
        checksum: reference
            .get("checksum")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

#[async_trait]
impl Component for OperatingSystemConfig {
    fn name(&self) -> &str {
        self.extension.name()
    }

    async fn deploy(&self, token: &CancellationToken) -> Result<()> {
        self.extension.deploy(token).await
    }

    async fn wait(&self, token: &CancellationToken) -> Result<()> {
        let reference = self
            .extension
            .object()
            .wait_ready_with(token, extract_cloud_config)
            .await?;
        *self.cloud_config.lock() = Some(reference);
        Ok(())
    }

    async fn destroy(&self, token: &CancellationToken) -> Result<()> {
        self.extension.destroy(token).await
    }

    async fn wait_cleanup(&self, token: &CancellationToken) -> Result<()> {
        self.extension.wait_cleanup(token).await
    }

    async fn migrate(&self, token: &CancellationToken) -> Result<()> {
        self.extension.migrate(token).await
    }

    async fn wait_migrate(&self, token: &CancellationToken) -> Result<()> {
        self.extension.wait_migrate(token).await
    }

    async fn restore(&self, token: &CancellationToken, prior: &PriorState) -> Result<()> {
        self.extension.restore(token, prior).await
    }
}
