use crate::component::Component;
use crate::managed::{ComponentContext, ManagedObject};
use async_trait::async_trait;
use serde_json::json;
use trellis_core::{CredentialClass, GroupVersionKind, ObjectKey};
use trellis_flow::{CancellationToken, Result};

/// Trust material of one credential class distributed to one dependent
///
/// `generations` lists every generation the dependent must accept;
/// `signing_generation` is the one new credentials are issued from.
pub struct TrustBundle {
    name: String,
    object: ManagedObject,
    class: CredentialClass,
    generations: Vec<u32>,
    signing_generation: u32,
}

impl TrustBundle {
    pub fn new(
        ctx: &ComponentContext,
        namespace: &str,
        dependent: &str,
        class: CredentialClass,
        generations: Vec<u32>,
        signing_generation: u32,
    ) -> Self {
        let name = format!("{}-{}", class.as_str(), dependent);
        let key = ObjectKey::new(GroupVersionKind::control_plane("TrustBundle"), namespace, &name);
        Self {
            name: format!("trust-bundle/{}", name),
            object: ctx.object(key),
            class,
            generations,
            signing_generation,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.object.key
    }

    pub fn generations(&self) -> &[u32] {
        &self.generations
    }
}

#[async_trait]
impl Component for TrustBundle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, _token: &CancellationToken) -> Result<()> {
        self.object
            .apply(json!({
                "class": self.class.as_str(),
                "generations": self.generations,
                "signingGeneration": self.signing_generation,
            }))
            .await?;
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
}
