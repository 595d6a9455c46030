use crate::component::Component;
use crate::managed::{ComponentContext, ManagedObject};
use async_trait::async_trait;
use trellis_core::{GroupVersionKind, ObjectKey};
use trellis_flow::{CancellationToken, Result};
use trellis_storage::PriorState;

/// A provider extension resource (infrastructure, network, control plane,
/// worker, DNS record, ...) reconciled by an external operator
///
/// The spec is opaque here; the operator reports back through the status
/// envelope and keeps migratable state in `status.state`.
pub struct Extension {
    name: String,
    object: ManagedObject,
    spec: serde_json::Value,
}

impl Extension {
    pub fn new(
        ctx: &ComponentContext,
        kind: &str,
        namespace: &str,
        name: &str,
        spec: serde_json::Value,
    ) -> Self {
        let key = ObjectKey::new(GroupVersionKind::extension(kind), namespace, name);
        Self {
            name: format!("{}/{}", kind.to_lowercase(), name),
            object: ctx.object(key),
            spec,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.object.key
    }

    pub fn object(&self) -> &ManagedObject {
        &self.object
    }
}

#[async_trait]
impl Component for Extension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, _token: &CancellationToken) -> Result<()> {
        self.object.apply(self.spec.clone()).await?;
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
        self.object.restore(self.spec.clone(), prior).await
    }
}
