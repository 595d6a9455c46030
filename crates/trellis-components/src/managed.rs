use crate::waiter::ReadinessWaiter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_core::{
    CredentialClass, ObjectKey, StoredObject, TrellisError, OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RECONCILE,
    OPERATION_RESTORE,
};
use trellis_flow::{CancellationToken, FlowError, PollConfig, Result, TimeoutConfig};
use trellis_storage::{ObjectStore, PriorState};

/// Store access shared by every component of one pass
#[derive(Clone)]
pub struct ComponentContext {
    pub store: Arc<dyn ObjectStore>,
    pub waiter: ReadinessWaiter,
    pub timeouts: TimeoutConfig,
}

impl ComponentContext {
    pub fn new(store: Arc<dyn ObjectStore>, timeouts: TimeoutConfig) -> Self {
        Self {
            waiter: ReadinessWaiter::new(store.clone()),
            store,
            timeouts,
        }
    }

    /// Handle on one object, with poll timing for its kind
    pub fn object(&self, key: ObjectKey) -> ManagedObject {
        let poll = self.timeouts.resolve(&key.gvk.kind);
        ManagedObject {
            key,
            store: self.store.clone(),
            waiter: self.waiter.clone(),
            poll,
        }
    }
}

/// One object in the backing store driven through the operation annotation
/// protocol
///
/// Every write that asks the owning operator for work carries the
/// `trellis.dev/operation` annotation. The operator removes it when it picks
/// the request up and reports the result in the status envelope.
#[derive(Clone)]
pub struct ManagedObject {
    pub key: ObjectKey,
    store: Arc<dyn ObjectStore>,
    waiter: ReadinessWaiter,
    pub poll: PollConfig,
}

fn operation(value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OPERATION_ANNOTATION.to_string(), value.to_string())])
}

impl ManagedObject {
    pub async fn get(&self) -> Result<Option<StoredObject>> {
        Ok(self.store.get(&self.key).await?)
    }

    /// Write the desired spec and request a reconcile
    pub async fn apply(&self, spec: serde_json::Value) -> Result<StoredObject> {
        let object = self
            .store
            .apply(&self.key, spec, operation(OPERATION_RECONCILE))
            .await?;
        debug!(resource = %self.key, generation = object.generation, "Applied desired state");
        Ok(object)
    }

    /// Change the spec of the existing object through `f` and request a reconcile
    pub async fn patch<F>(&self, f: F) -> Result<StoredObject>
    where
        F: FnOnce(&mut serde_json::Value) + Send,
    {
        let mut object = self
            .get()
            .await?
            .ok_or_else(|| FlowError::from(TrellisError::object_not_found(self.key.to_string())))?;
        f(&mut object.spec);
        object
            .annotations
            .insert(OPERATION_ANNOTATION.to_string(), OPERATION_RECONCILE.to_string());
        Ok(self.store.update(object).await?)
    }

    /// Replica count in the stored spec, `None` if the object does not exist
    pub async fn replicas(&self) -> Result<Option<i32>> {
        let Some(object) = self.get().await? else {
            return Ok(None);
        };
        let raw = object.spec.get("replicas");
        let replicas = raw
            .and_then(|r| r.as_i64())
            .and_then(|r| i32::try_from(r).ok())
            .filter(|r| *r >= 0)
            .ok_or_else(|| {
                TrellisError::invalid_object(
                    format!("{} has an invalid replica count {:?}", self.key, raw),
                    "spec.replicas must be an integer between 0 and 2147483647",
                )
            })?;
        Ok(Some(replicas))
    }

    pub async fn wait_ready(&self, token: &CancellationToken) -> Result<()> {
        self.waiter
            .wait_ready(token, &self.key, &self.poll, |_| Ok(()))
            .await
    }

    pub async fn wait_ready_with<T, F>(&self, token: &CancellationToken, extract: F) -> Result<T>
    where
        T: Send,
        F: Fn(&StoredObject) -> Result<T> + Send + Sync,
    {
        self.waiter
            .wait_ready(token, &self.key, &self.poll, extract)
            .await
    }

    pub async fn destroy(&self) -> Result<()> {
        if self.store.delete(&self.key).await? {
            info!(resource = %self.key, "Requested deletion");
        } else {
            debug!(resource = %self.key, "Already absent");
        }
        Ok(())
    }

    pub async fn wait_cleanup(&self, token: &CancellationToken) -> Result<()> {
        self.waiter.wait_deleted(token, &self.key, &self.poll).await
    }

    /// Request migration; an absent object has nothing to migrate
    pub async fn migrate(&self) -> Result<()> {
        if self.get().await?.is_none() {
            debug!(resource = %self.key, "Absent, skipping migration");
            return Ok(());
        }
        self.store
            .annotate(&self.key, OPERATION_ANNOTATION, OPERATION_MIGRATE)
            .await?;
        info!(resource = %self.key, "Requested migration");
        Ok(())
    }

    pub async fn wait_migrated(&self, token: &CancellationToken) -> Result<()> {
        self.waiter.wait_migrated(token, &self.key, &self.poll).await
    }

    /// Whether the operator reports the workload running with credential
    /// generation `expected`
    pub async fn credentials_adopted(&self, class: CredentialClass, expected: u32) -> Result<bool> {
        let Some(object) = self.get().await? else {
            return Ok(false);
        };
        let observed = object
            .status
            .provider_status
            .as_ref()
            .and_then(|status| status.get("credentials"))
            .and_then(|credentials| credentials.get(class.as_str()))
            .and_then(|generation| generation.as_u64());
        Ok(object.is_observed() && observed == Some(u64::from(expected)))
    }

    /// Write the desired spec, seed the status with the captured state and
    /// request a restore
    ///
    /// The restore annotation goes on last, so an operator never sees the
    /// request before the state it restores from.
    pub async fn restore(&self, spec: serde_json::Value, prior: &PriorState) -> Result<()> {
        let object = self.store.apply(&self.key, spec, BTreeMap::new()).await?;

        let seeded = match prior.state_of(&self.key) {
            Some(state) => {
                let mut status = object.status;
                status.state = Some(state.clone());
                self.store.update_status(&self.key, status).await?;
                true
            }
            None => false,
        };

        self.store
            .annotate(&self.key, OPERATION_ANNOTATION, OPERATION_RESTORE)
            .await?;
        if seeded {
            info!(resource = %self.key, "Requested restore from captured state");
        } else {
            info!(resource = %self.key, "Requested restore without captured state");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use trellis_core::{GroupVersionKind, StatusEnvelope};
    use trellis_storage::{KvObjectStore, MemoryBackend};

    /// Records (pending operation, state present) after every write
    struct RecordingStore {
        inner: KvObjectStore,
        writes: Mutex<Vec<(Option<String>, bool)>>,
    }

    impl RecordingStore {
        fn record(&self, object: &StoredObject) {
            self.writes.lock().push((
                object.pending_operation().map(str::to_string),
                object.status.state.is_some(),
            ));
        }
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn get(&self, key: &ObjectKey) -> trellis_storage::Result<Option<StoredObject>> {
            self.inner.get(key).await
        }

        async fn list(
            &self,
            gvk: &GroupVersionKind,
            namespace: Option<&str>,
        ) -> trellis_storage::Result<Vec<StoredObject>> {
            self.inner.list(gvk, namespace).await
        }

        async fn create(&self, object: StoredObject) -> trellis_storage::Result<StoredObject> {
            let object = self.inner.create(object).await?;
            self.record(&object);
            Ok(object)
        }

        async fn apply(
            &self,
            key: &ObjectKey,
            spec: serde_json::Value,
            annotations: BTreeMap<String, String>,
        ) -> trellis_storage::Result<StoredObject> {
            let object = self.inner.apply(key, spec, annotations).await?;
            self.record(&object);
            Ok(object)
        }

        async fn update(&self, object: StoredObject) -> trellis_storage::Result<StoredObject> {
            let object = self.inner.update(object).await?;
            self.record(&object);
            Ok(object)
        }

        async fn update_status(
            &self,
            key: &ObjectKey,
            status: StatusEnvelope,
        ) -> trellis_storage::Result<StoredObject> {
            let object = self.inner.update_status(key, status).await?;
            self.record(&object);
            Ok(object)
        }

        async fn annotate(
            &self,
            key: &ObjectKey,
            name: &str,
            value: &str,
        ) -> trellis_storage::Result<StoredObject> {
            let object = self.inner.annotate(key, name, value).await?;
            self.record(&object);
            Ok(object)
        }

        async fn remove_annotation(
            &self,
            key: &ObjectKey,
            name: &str,
        ) -> trellis_storage::Result<StoredObject> {
            let object = self.inner.remove_annotation(key, name).await?;
            self.record(&object);
            Ok(object)
        }

        async fn delete(&self, key: &ObjectKey) -> trellis_storage::Result<bool> {
            self.inner.delete(key).await
        }

        async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> trellis_storage::Result<()> {
            self.inner.remove_finalizer(key, finalizer).await
        }
    }

    fn context() -> ComponentContext {
        ComponentContext::new(
            Arc::new(KvObjectStore::new(Arc::new(MemoryBackend::new()))),
            TimeoutConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_restore_seeds_state() {
        let ctx = context();
        let key = ObjectKey::new(GroupVersionKind::extension("Worker"), "shoot--dev--a", "a");
        let object = ctx.object(key.clone());

        let mut prior = PriorState::new();
        prior.insert(&key, json!({"machines": ["m-1"]}));
        object.restore(json!({"pools": []}), &prior).await.unwrap();

        let stored = object.get().await.unwrap().unwrap();
        assert_eq!(stored.pending_operation(), Some(OPERATION_RESTORE));
        assert_eq!(stored.status.state, Some(json!({"machines": ["m-1"]})));
    }

    #[tokio::test]
    async fn test_restore_request_follows_state() {
        let store = Arc::new(RecordingStore {
            inner: KvObjectStore::new(Arc::new(MemoryBackend::new())),
            writes: Mutex::new(Vec::new()),
        });
        let ctx = ComponentContext::new(store.clone(), TimeoutConfig::default());
        let key = ObjectKey::new(GroupVersionKind::extension("Infrastructure"), "shoot--dev--a", "a");

        let mut prior = PriorState::new();
        prior.insert(&key, json!({"vpc": "vpc-1"}));
        ctx.object(key).restore(json!({"region": "eu-1"}), &prior).await.unwrap();

        let writes = store.writes.lock().clone();
        let first_request = writes
            .iter()
            .find(|(op, _)| op.as_deref() == Some(OPERATION_RESTORE))
            .unwrap();
        assert!(first_request.1);
        assert_eq!(writes.last().unwrap(), &(Some(OPERATION_RESTORE.to_string()), true));
    }

    #[tokio::test]
    async fn test_replicas_rejects_invalid_counts() {
        let ctx = context();
        let key = ObjectKey::new(GroupVersionKind::control_plane("Etcd"), "shoot--dev--a", "etcd-main");
        let object = ctx.object(key);
        assert_eq!(object.replicas().await.unwrap(), None);

        object.apply(json!({"replicas": 3})).await.unwrap();
        assert_eq!(object.replicas().await.unwrap(), Some(3));

        for invalid in [json!({"replicas": 5_000_000_000i64}), json!({"replicas": -1}), json!({"replicas": "three"}), json!({})] {
            object.apply(invalid).await.unwrap();
            let err = object.replicas().await.unwrap_err();
            assert!(err.to_string().contains("invalid replica count"), "{}", err);
        }
    }

    #[tokio::test]
    async fn test_migrate_absent_is_noop() {
        let ctx = context();
        let key = ObjectKey::new(GroupVersionKind::extension("Network"), "shoot--dev--a", "a");
        ctx.object(key.clone()).migrate().await.unwrap();
        assert!(ctx.store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_requests_reconcile() {
        let ctx = context();
        let key = ObjectKey::new(GroupVersionKind::control_plane("Etcd"), "shoot--dev--a", "etcd-main");
        let object = ctx.object(key);
        object.apply(json!({"replicas": 1})).await.unwrap();
        ctx.store
            .remove_annotation(&object.key, OPERATION_ANNOTATION)
            .await
            .unwrap();

        let patched = object.patch(|spec| spec["replicas"] = json!(3)).await.unwrap();
        assert_eq!(patched.spec["replicas"], 3);
        assert_eq!(patched.generation, 2);
        assert_eq!(patched.pending_operation(), Some(OPERATION_RECONCILE));
    }
}
