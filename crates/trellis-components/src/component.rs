use async_trait::async_trait;
use std::collections::BTreeMap;
use trellis_core::CredentialClass;
use trellis_flow::{CancellationToken, Result, Step};
use trellis_storage::PriorState;

/// Credential generation a workload is configured with, per class
pub type CredentialGenerations = BTreeMap<CredentialClass, u32>;

/// Lifecycle contract every managed sub-resource implements
///
/// Orchestration code only ever talks to this trait. `deploy`, `destroy`,
/// `migrate` and `restore` submit a desired-state write and return promptly;
/// the `wait*` methods block (through the poller) until the write took
/// observable effect.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable name, used for step names and logs
    fn name(&self) -> &str;

    /// Idempotently converge the backing resource towards the desired values
    async fn deploy(&self, token: &CancellationToken) -> Result<()>;

    /// Wait until the most recent deploy or restore has taken effect
    async fn wait(&self, token: &CancellationToken) -> Result<()>;

    /// Request deletion of the backing resource
    async fn destroy(&self, token: &CancellationToken) -> Result<()>;

    /// Wait until the backing resource is gone; an absent resource is success
    async fn wait_cleanup(&self, token: &CancellationToken) -> Result<()>;

    /// Hand the resource off to another seed without destroying what it manages
    async fn migrate(&self, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn wait_migrate(&self, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Recreate the resource from state captured on the previous seed
    ///
    /// Resources without operator state deploy from their desired values.
    async fn restore(&self, token: &CancellationToken, _prior: &PriorState) -> Result<()> {
        self.deploy(token).await
    }
}

/// A component whose workload runs with a replica count
#[async_trait]
pub trait Scalable: Component {
    /// Replica count the desired values ask for
    fn desired_replicas(&self) -> i32;

    /// Replica count of the existing resource, `None` if it does not exist
    async fn current_replicas(&self) -> Result<Option<i32>>;

    /// Deploy with the replica count overridden
    async fn deploy_with_replicas(&self, token: &CancellationToken, replicas: i32) -> Result<()>;

    /// Restore from captured state with the replica count overridden
    ///
    /// Resources without operator state deploy with the overridden count.
    async fn restore_with_replicas(
        &self,
        token: &CancellationToken,
        replicas: i32,
        _prior: &PriorState,
    ) -> Result<()> {
        self.deploy_with_replicas(token, replicas).await
    }

    /// Change only the replica count of the existing resource
    async fn scale(&self, token: &CancellationToken, replicas: i32) -> Result<()>;
}

/// A component that authenticates with rotated credentials
#[async_trait]
pub trait CredentialConsumer: Component {
    /// Whether the running workload has picked up the credentials it was
    /// last deployed with
    async fn credentials_adopted(&self, class: CredentialClass) -> Result<bool>;
}

pub async fn deploy_and_wait(component: &dyn Component, token: &CancellationToken) -> Result<()> {
    component.deploy(token).await?;
    component.wait(token).await
}

pub async fn destroy_and_wait(component: &dyn Component, token: &CancellationToken) -> Result<()> {
    component.destroy(token).await?;
    component.wait_cleanup(token).await
}

pub async fn migrate_and_wait(component: &dyn Component, token: &CancellationToken) -> Result<()> {
    component.migrate(token).await?;
    component.wait_migrate(token).await
}

pub async fn restore_and_wait(
    component: &dyn Component,
    token: &CancellationToken,
    prior: &PriorState,
) -> Result<()> {
    component.restore(token, prior).await?;
    component.wait(token).await
}

/// Step running deploy then wait
pub fn deploy_step<'a>(component: &'a dyn Component) -> Step<'a> {
    Step::new(format!("deploy {}", component.name()), move |token| async move {
        deploy_and_wait(component, &token).await
    })
}

/// Step running destroy then wait-cleanup
pub fn destroy_step<'a>(component: &'a dyn Component) -> Step<'a> {
    Step::new(format!("destroy {}", component.name()), move |token| async move {
        destroy_and_wait(component, &token).await
    })
}

/// Step running migrate then wait-migrate
pub fn migrate_step<'a>(component: &'a dyn Component) -> Step<'a> {
    Step::new(format!("migrate {}", component.name()), move |token| async move {
        migrate_and_wait(component, &token).await
    })
}
