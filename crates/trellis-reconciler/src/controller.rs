use crate::hibernation::HibernationConfig;
use crate::operation::{shoot_cluster, ShootOperation};
use crate::rotation::{begin_pass, finish_pass};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use trellis_components::ComponentContext;
use trellis_core::{
    GroupVersionKind, LastError, LastOperation, LastOperationState, LastOperationType, ObjectKey,
    Shoot, ShootStatus, StoredObject, TrellisError,
};
use trellis_flow::{CancellationToken, FlowError, Result, TimeoutConfig};
use trellis_storage::{KVStore, KvObjectStore, ObjectStore, SnapshotStore};
use uuid::Uuid;

/// Configuration for the shoot controller
#[derive(Debug, Clone)]
pub struct ShootControllerConfig {
    /// Interval between full resyncs of all shoots
    pub sync_interval: Duration,
    /// Upper bound on shoots reconciled at the same time
    pub max_concurrent_reconciles: usize,
    /// A pass running longer than this is cancelled and recorded as aborted
    pub reconcile_timeout: Duration,
}

impl Default for ShootControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            max_concurrent_reconciles: 5,
            reconcile_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Drives every shoot in the store through its passes
///
/// Each shoot has at most one pass in flight; different shoots are
/// reconciled concurrently up to the configured limit.
pub struct ShootController {
    store: Arc<dyn ObjectStore>,
    kv: Arc<dyn KVStore>,
    snapshots: SnapshotStore,
    timeouts: TimeoutConfig,
    hibernation: HibernationConfig,
    config: ShootControllerConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<ObjectKey>>>,
}

/// Releases a shoot's in-flight slot however its task ends
struct InFlight {
    key: ObjectKey,
    in_flight: Arc<Mutex<HashSet<ObjectKey>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

impl ShootController {
    pub fn new(
        kv: Arc<dyn KVStore>,
        timeouts: TimeoutConfig,
        hibernation: HibernationConfig,
        config: ShootControllerConfig,
    ) -> Self {
        Self {
            store: Arc::new(KvObjectStore::new(kv.clone())),
            snapshots: SnapshotStore::new(kv.clone()),
            kv,
            timeouts,
            hibernation,
            permits: Arc::new(Semaphore::new(config.max_concurrent_reconciles.max(1))),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Run the controller loop until the token is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        info!(
            "Starting shoot controller (sync interval: {:?}, max concurrent: {})",
            self.config.sync_interval, self.config.max_concurrent_reconciles
        );

        let mut interval = tokio::time::interval(self.config.sync_interval);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Shoot controller shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_all(&token, &mut tasks).await {
                        error!("Failed to sync shoots: {}", e);
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Shoot reconcile task failed: {}", e);
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn sync_all(self: &Arc<Self>, token: &CancellationToken, tasks: &mut JoinSet<()>) -> Result<()> {
        let shoots = self.store.list(&GroupVersionKind::shoot(), None).await?;
        debug!("Syncing {} shoots", shoots.len());

        for object in shoots {
            let key = object.key;
            if !self.in_flight.lock().insert(key.clone()) {
                debug!(shoot = %key, "Pass still in flight, skipping");
                continue;
            }
            let guard = InFlight {
                key: key.clone(),
                in_flight: self.in_flight.clone(),
            };

            let controller = self.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = controller.permits.clone().acquire_owned().await else {
                    return;
                };
                match controller.reconcile_shoot(&key, &token).await {
                    Ok(operation) => debug!(shoot = %key, %operation, "Pass finished"),
                    Err(e) => warn!(shoot = %key, "Pass failed: {}", e),
                }
            });
        }
        Ok(())
    }

    /// Run one pass over a shoot and record its outcome
    pub async fn reconcile_shoot(
        &self,
        key: &ObjectKey,
        token: &CancellationToken,
    ) -> Result<LastOperationType> {
        let object = self.load(key).await?;
        let shoot = Shoot::from_object(&object)?;
        let operation = shoot.next_operation();

        let shoot = match operation {
            LastOperationType::Create | LastOperationType::Reconcile | LastOperationType::Restore => {
                match self.consume_rotation_requests(object, shoot).await {
                    Ok(shoot) => shoot,
                    Err(e) => {
                        self.record_failure(key, operation, &e).await?;
                        return Err(e);
                    }
                }
            }
            _ => shoot,
        };

        self.record(
            key,
            LastOperation::new(
                operation,
                LastOperationState::Processing,
                format!("{} in progress", operation),
            ),
            None,
        )
        .await?;

        let span = info_span!(
            "shoot",
            shoot = %key,
            operation = %operation,
            operation_id = %Uuid::new_v4(),
        );
        let result = self.execute(shoot, operation, token).instrument(span).await;

        match result {
            Ok(hibernating) => {
                self.record_success(key, operation, hibernating).await?;
                Ok(operation)
            }
            Err(e) => {
                self.record_failure(key, operation, &e).await?;
                Err(e)
            }
        }
    }

    /// Returns whether the pass ran towards hibernation
    async fn execute(
        &self,
        shoot: Shoot,
        operation: LastOperationType,
        token: &CancellationToken,
    ) -> Result<bool> {
        info!("Starting {} pass", operation);

        let ctx = ComponentContext::new(self.store.clone(), self.timeouts.clone());
        let cluster = Arc::new(shoot_cluster(self.kv.clone(), &shoot.key));
        let pass = ShootOperation::new(
            shoot,
            operation,
            ctx,
            cluster,
            self.snapshots.clone(),
            self.hibernation,
        );
        let hibernating = pass.flags().hibernation.is_requested();

        let child = token.child_token();
        let deadline = child.clone();
        let timeout = self.config.reconcile_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("Pass exceeded {:?}, cancelling", timeout);
            deadline.cancel();
        });

        let result = pass.run(&child, operation).await;
        timer.abort();

        match &result {
            Ok(()) => info!("{} pass succeeded", operation),
            Err(e) => error!("{} pass failed: {}", operation, e),
        }
        result.map(|()| hibernating)
    }

    async fn load(&self, key: &ObjectKey) -> Result<StoredObject> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| FlowError::from(TrellisError::object_not_found(key.to_string())))
    }

    /// Apply pending rotation requests to the recorded phases and clear them
    /// from the spec
    async fn consume_rotation_requests(&self, mut object: StoredObject, mut shoot: Shoot) -> Result<Shoot> {
        if shoot.spec.credentials_rotation.is_empty() {
            return Ok(shoot);
        }

        for (class, request) in std::mem::take(&mut shoot.spec.credentials_rotation) {
            let current = shoot.status.rotation.get(&class).copied().unwrap_or_default();
            let next = begin_pass(class, current, Some(request))?;
            shoot.status.rotation.insert(class, next);
        }

        object.spec = trellis_core::to_value(&shoot.spec)?;
        object.status.state = Some(trellis_core::to_value(&shoot.status)?);
        let updated = self.store.update(object).await?;
        shoot.resource_version = updated.resource_version;
        shoot.generation = updated.generation;
        Ok(shoot)
    }

    async fn record(
        &self,
        key: &ObjectKey,
        last_operation: LastOperation,
        last_error: Option<LastError>,
    ) -> Result<StoredObject> {
        let object = self.load(key).await?;
        let mut status = object.status;
        status.last_operation = Some(last_operation);
        status.last_error = last_error;
        Ok(self.store.update_status(key, status).await?)
    }

    async fn record_success(
        &self,
        key: &ObjectKey,
        operation: LastOperationType,
        hibernating: bool,
    ) -> Result<()> {
        if operation == LastOperationType::Delete {
            self.store.delete(key).await?;
            info!(shoot = %key, "Shoot deleted");
            return Ok(());
        }

        let object = self.load(key).await?;
        let shoot = Shoot::from_object(&object)?;
        let status = if operation == LastOperationType::Migrate {
            shoot.status
        } else {
            next_status(&shoot, hibernating)
        };

        let mut envelope = object.status;
        envelope.last_operation = Some(LastOperation::new(
            operation,
            LastOperationState::Succeeded,
            format!("{} succeeded", operation),
        ));
        envelope.last_error = None;
        envelope.observed_generation = Some(object.generation);
        envelope.state = Some(trellis_core::to_value(&status)?);
        self.store.update_status(key, envelope).await?;
        Ok(())
    }

    async fn record_failure(&self, key: &ObjectKey, operation: LastOperationType, err: &FlowError) -> Result<()> {
        let state = if err.is_cancelled() {
            LastOperationState::Aborted
        } else {
            LastOperationState::Error
        };
        let description = err.to_string();
        self.record(
            key,
            LastOperation::new(operation, state, description.clone()),
            Some(LastError::new(description, err.error_codes())),
        )
        .await?;
        Ok(())
    }
}

/// Status after a successful pass that placed the control plane on the
/// desired seed
fn next_status(shoot: &Shoot, hibernating: bool) -> ShootStatus {
    let mut status = shoot.status.clone();
    status.seed_name = Some(shoot.spec.seed_name.clone());
    status.hibernated = hibernating;

    // Rotations only advance while the control plane is running
    if !hibernating {
        for (class, phase) in status.rotation.iter_mut() {
            let generation = shoot.status.credential_generation(*class);
            let (next, generation) = finish_pass(*phase, generation);
            *phase = next;
            status.credential_generations.insert(*class, generation);
        }
    }
    status
}
