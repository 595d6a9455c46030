use crate::component::{Component, CredentialConsumer, CredentialGenerations, Scalable};
use crate::managed::{ComponentContext, ManagedObject};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;
use trellis_core::{CredentialClass, GroupVersionKind, ObjectKey};
use trellis_flow::{CancellationToken, Result};

/// Pod template annotation prefix recording the credential generation a
/// workload was rolled out with
pub const CREDENTIALS_ANNOTATION_PREFIX: &str = "credentials.trellis.dev/";

/// Desired values of a control-plane deployment
#[derive(Debug, Clone, Default)]
pub struct DeploymentValues {
    pub replicas: i32,
    pub image: String,
    pub args: Vec<String>,
    pub credentials: CredentialGenerations,
}

/// A control-plane workload (kube-apiserver, kube-controller-manager,
/// kube-scheduler) running as a Deployment in the shoot's seed namespace
pub struct ControlPlaneDeployment {
    name: String,
    object: ManagedObject,
    values: DeploymentValues,
}

impl ControlPlaneDeployment {
    pub fn new(ctx: &ComponentContext, namespace: &str, name: &str, values: DeploymentValues) -> Self {
        let key = ObjectKey::new(
            GroupVersionKind::from_api_version_kind("apps/v1", "Deployment"),
            namespace,
            name,
        );
        Self {
            name: name.to_string(),
            object: ctx.object(key),
            values,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.object.key
    }

    fn spec(&self, replicas: i32) -> Result<serde_json::Value> {
        let labels = BTreeMap::from([
            ("app".to_string(), "kubernetes".to_string()),
            ("role".to_string(), self.name.clone()),
        ]);
        let annotations: BTreeMap<String, String> = self
            .values
            .credentials
            .iter()
            .map(|(class, generation)| {
                (
                    format!("{}{}", CREDENTIALS_ANNOTATION_PREFIX, class.as_str()),
                    generation.to_string(),
                )
            })
            .collect();

        let spec = DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: (!annotations.is_empty()).then_some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: self.name.clone(),
                        image: Some(self.values.image.clone()),
                        args: (!self.values.args.is_empty()).then(|| self.values.args.clone()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        };

        Ok(trellis_core::to_value(&spec)?)
    }
}

#[async_trait]
impl Component for ControlPlaneDeployment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, _token: &CancellationToken) -> Result<()> {
        self.object.apply(self.spec(self.values.replicas)?).await?;
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

#[async_trait]
impl Scalable for ControlPlaneDeployment {
    fn desired_replicas(&self) -> i32 {
        self.values.replicas
    }

    async fn current_replicas(&self) -> Result<Option<i32>> {
        self.object.replicas().await
    }

    async fn deploy_with_replicas(&self, _token: &CancellationToken, replicas: i32) -> Result<()> {
        info!(resource = %self.object.key, replicas, "Deploying with overridden replica count");
        self.object.apply(self.spec(replicas)?).await?;
        Ok(())
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
impl CredentialConsumer for ControlPlaneDeployment {
    async fn credentials_adopted(&self, class: CredentialClass) -> Result<bool> {
        match self.values.credentials.get(&class) {
            Some(expected) => self.object.credentials_adopted(class, *expected).await,
            None => Ok(true),
        }
    }
}
