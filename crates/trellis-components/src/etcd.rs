use crate::component::{Component, CredentialConsumer, CredentialGenerations, Scalable};
use crate::managed::{ComponentContext, ManagedObject};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use trellis_core::{CredentialClass, GroupVersionKind, ObjectKey};
use trellis_flow::{CancellationToken, Result};
use trellis_storage::PriorState;

/// Configuration of the store cluster backing a shoot's API server
#[derive(Debug, Clone)]
pub struct EtcdValues {
    pub replicas: i32,
    pub storage_capacity: String,
    /// Backup bucket the cluster snapshots into and restores from
    pub backup_bucket: Option<String>,
    pub credentials: CredentialGenerations,
}

impl Default for EtcdValues {
    fn default() -> Self {
        Self {
            replicas: 1,
            storage_capacity: "10Gi".to_string(),
            backup_bucket: None,
            credentials: CredentialGenerations::new(),
        }
    }
}

/// The etcd cluster of a shoot, run by an etcd operator in the seed
pub struct Etcd {
    name: String,
    object: ManagedObject,
    values: EtcdValues,
}

impl Etcd {
    pub fn new(ctx: &ComponentContext, namespace: &str, role: &str, values: EtcdValues) -> Self {
        let name = format!("etcd-{}", role);
        let key = ObjectKey::new(GroupVersionKind::control_plane("Etcd"), namespace, &name);
        Self {
            name,
            object: ctx.object(key),
            values,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.object.key
    }

    fn spec(&self, replicas: i32) -> serde_json::Value {
        let credentials: serde_json::Map<String, serde_json::Value> = self
            .values
            .credentials
            .iter()
            .map(|(class, generation)| (class.as_str().to_string(), json!(generation)))
            .collect();
        json!({
            "replicas": replicas,
            "storageCapacity": self.values.storage_capacity,
            "backup": self.values.backup_bucket.as_ref().map(|bucket| json!({"bucket": bucket})),
            "credentials": credentials,
        })
    }
}

#[async_trait]
impl Component for Etcd {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, _token: &CancellationToken) -> Result<()> {
        self.object.apply(self.spec(self.values.replicas)).await?;
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

    // The operator on the new seed restores data from the backup bucket
    async fn restore(&self, _token: &CancellationToken, prior: &PriorState) -> Result<()> {
        self.object
            .restore(self.spec(self.values.replicas), prior)
            .await
    }
}

#[async_trait]
impl Scalable for Etcd {
    fn desired_replicas(&self) -> i32 {
        self.values.replicas
    }

    async fn current_replicas(&self) -> Result<Option<i32>> {
        self.object.replicas().await
    }

    async fn deploy_with_replicas(&self, _token: &CancellationToken, replicas: i32) -> Result<()> {
        info!(resource = %self.object.key, replicas, "Deploying with overridden replica count");
        self.object.apply(self.spec(replicas)).await?;
        Ok(())
    }

    async fn restore_with_replicas(
        &self,
        _token: &CancellationToken,
        replicas: i32,
        prior: &PriorState,
    ) -> Result<()> {
        info!(resource = %self.object.key, replicas, "Restoring with overridden replica count");
        self.object.restore(self.spec(replicas), prior).await
    }

    async fn scale(&self, _token: &CancellationToken, replicas: i32) -> Result<()> {
        info!(resource = %self.object.key, replicas, "Scaling");
        self.object
            .patch(|spec| spec["replicas"] = json!(replicas))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialConsumer for Etcd {
    async fn credentials_adopted(&self, class: CredentialClass) -> Result<bool> {
        match self.values.credentials.get(&class) {
            Some(expected) => self.object.credentials_adopted(class, *expected).await,
            None => Ok(true),
        }
    }
}
