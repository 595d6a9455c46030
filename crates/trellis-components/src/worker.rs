use crate::component::Component;
use crate::managed::{ComponentContext, ManagedObject};
use crate::operating_system_config::OperatingSystemConfig;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use trellis_core::{GroupVersionKind, ObjectKey, WorkerPool};
use trellis_flow::{CancellationToken, FlowError, Result};
use trellis_storage::PriorState;

/// Machines of all worker pools, reconciled by the provider's worker operator
///
/// The spec references the cloud-config of every pool, so the operating
/// system configs must have been waited for before deploying.
pub struct Worker {
    name: String,
    object: ManagedObject,
    pools: Vec<WorkerPool>,
    configs: Vec<Arc<OperatingSystemConfig>>,
    /// Pools are scaled to zero while hibernated
    hibernated: bool,
}

impl Worker {
    pub fn new(
        ctx: &ComponentContext,
        namespace: &str,
        shoot_name: &str,
        pools: Vec<WorkerPool>,
        configs: Vec<Arc<OperatingSystemConfig>>,
        hibernated: bool,
    ) -> Self {
        let key = ObjectKey::new(GroupVersionKind::extension("Worker"), namespace, shoot_name);
        Self {
            name: format!("worker/{}", shoot_name),
            object: ctx.object(key),
            pools,
            configs,
            hibernated,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.object.key
    }

    fn spec(&self) -> Result<serde_json::Value> {
        let mut pools = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            let cloud_config = self
                .configs
                .iter()
                .find(|c| c.pool() == pool.name)
                .and_then(|c| c.cloud_config())
                .ok_or_else(|| {
                    FlowError::severe(
                        format!("deploy {}", self.name),
                        format!("no cloud config rendered for pool {}", pool.name),
                    )
                })?;

            let (minimum, maximum) = if self.hibernated {
                (0, 0)
            } else {
                (pool.minimum, pool.maximum)
            };
            pools.push(json!({
                "name": pool.name,
                "machineType": pool.machine_type,
                "minimum": minimum,
                "maximum": maximum,
                "userDataSecretRef": {"name": cloud_config.secret_name},
            }));
        }
        Ok(json!({ "pools": pools }))
    }
}

#[async_trait]
impl Component for Worker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, _token: &CancellationToken) -> Result<()> {
        self.object.apply(self.spec()?).await?;
        Ok(())
    }

    async fn wait(&self, token: &CancellationToken) -> Result<()> {
        self.object.wait_ready(token).await
    }

    async fn destroy(&self, _token: &CancellationToken) -> Result<()> {
        self.object.destroy().await
    }

    async fn wait_cleanup(&self, token: &CancellationToken) -> Result<()> {
        self.object.wait_cleanup(token).await
    }

    async fn migrate(&self, _token: &CancellationToken) -> Result<()> {
        self.object.migrate().await
    }

    async fn wait_migrate(&self, token: &CancellationToken) -> Result<()> {
        self.object.wait_migrated(token).await
    }

    async fn restore(&self, _token: &CancellationToken, prior: &PriorState) -> Result<()> {
        self.object.restore(self.spec()?, prior).await
    }
}
