use crate::{KVStore, KeyEncoder, Result, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_core::{GroupVersionKind, ObjectKey, StatusEnvelope, StoredObject, TrellisError};

/// Typed access to the objects managed by components and their operators
///
/// Writes are optimistic: every write bumps `resource_version`, and
/// [`ObjectStore::update`] rejects a stale version with a conflict.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object, `None` if absent
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>>;

    /// List objects of a kind, optionally restricted to one namespace
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredObject>>;

    /// Create a new object; fails if it already exists
    async fn create(&self, object: StoredObject) -> Result<StoredObject>;

    /// Create the object or bring its spec and annotations to the given values
    ///
    /// Applying an unchanged spec with annotations that are already present
    /// performs no write at all.
    async fn apply(
        &self,
        key: &ObjectKey,
        spec: serde_json::Value,
        annotations: BTreeMap<String, String>,
    ) -> Result<StoredObject>;

    /// Replace an object, guarded by its `resource_version`
    async fn update(&self, object: StoredObject) -> Result<StoredObject>;

    /// Replace only the status envelope, as the owning operator does
    async fn update_status(&self, key: &ObjectKey, status: StatusEnvelope)
        -> Result<StoredObject>;

    /// Set an annotation
    async fn annotate(&self, key: &ObjectKey, name: &str, value: &str) -> Result<StoredObject>;

    /// Remove an annotation, no-op if absent
    async fn remove_annotation(&self, key: &ObjectKey, name: &str) -> Result<StoredObject>;

    /// Request deletion
    ///
    /// Objects without finalizers disappear immediately; others are marked
    /// terminating until their last finalizer is removed. Returns false if
    /// the object did not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;

    /// Remove a finalizer, completing a pending deletion when it was the last one
    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()>;
}

/// [`ObjectStore`] over any [`KVStore`] backend
///
/// A scope prefixes every key, so several logical clusters (the seed and
/// each shoot) can share one backend.
#[derive(Clone)]
pub struct KvObjectStore {
    kv: Arc<dyn KVStore>,
    scope: String,
}

impl KvObjectStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self {
            kv,
            scope: String::new(),
        }
    }

    /// A store whose keys live under `scope/`
    pub fn scoped(kv: Arc<dyn KVStore>, scope: impl Into<String>) -> Self {
        Self {
            kv,
            scope: format!("{}/", scope.into()),
        }
    }

    fn object_key(&self, key: &ObjectKey) -> String {
        format!("{}{}", self.scope, KeyEncoder::encode_object_key(key))
    }

    /// Underlying key-value store
    pub fn kv(&self) -> &Arc<dyn KVStore> {
        &self.kv
    }

    fn decode(key: &[u8], data: &[u8]) -> Result<StoredObject> {
        serde_json::from_slice(data).map_err(|e| {
            StorageError::serialization_error(
                format!(
                    "Failed to decode object at {}: {}",
                    String::from_utf8_lossy(key),
                    e
                ),
                Some(Box::new(e)),
            )
        })
    }

    /// Read-modify-write of a single object inside one transaction
    ///
    /// `f` receives the current object and returns the object to store, or
    /// `None` to remove it. Returning the same object unchanged skips the write.
    fn modify<F>(&self, key: &ObjectKey, f: F) -> Result<Option<StoredObject>>
    where
        F: FnOnce(Option<StoredObject>) -> Result<Option<StoredObject>>,
    {
        let storage_key = self.object_key(key);
        let mut txn = self.kv.transaction()?;

        let current = match txn.get(storage_key.as_bytes())? {
            Some(data) => Some(Self::decode(storage_key.as_bytes(), &data)?),
            None => None,
        };

        let next = f(current.clone())?;
        if next == current {
            txn.rollback()?;
            return Ok(next);
        }

        match &next {
            Some(object) => {
                let data = serde_json::to_vec(object)?;
                txn.put(storage_key.as_bytes(), &data)?;
            }
            None => txn.delete(storage_key.as_bytes())?,
        }

        txn.commit().map_err(|e| match e {
            StorageError::TransactionError { .. } => StorageError::Object(TrellisError::conflict(
                key.to_string(),
                current.as_ref().map(|o| o.resource_version).unwrap_or(0),
                current.as_ref().map(|o| o.resource_version + 1).unwrap_or(0),
            )),
            other => other,
        })?;

        Ok(next)
    }

    fn existing(key: &ObjectKey, current: Option<StoredObject>) -> Result<StoredObject> {
        current.ok_or_else(|| StorageError::Object(TrellisError::object_not_found(key.to_string())))
    }

    fn stored(key: &ObjectKey, object: Option<StoredObject>) -> Result<StoredObject> {
        object.ok_or_else(|| {
            StorageError::Object(TrellisError::internal_error(format!(
                "Object {} vanished during write",
                key
            )))
        })
    }
}

#[async_trait]
impl ObjectStore for KvObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>> {
        let storage_key = self.object_key(key);
        match self.kv.get(storage_key.as_bytes())? {
            Some(data) => Ok(Some(Self::decode(storage_key.as_bytes(), &data)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredObject>> {
        let prefix = format!("{}{}", self.scope, KeyEncoder::encode_prefix(gvk, namespace));
        let entries = self.kv.scan(prefix.as_bytes())?;

        let mut objects = Vec::with_capacity(entries.len());
        for (key, data) in entries {
            let object = Self::decode(&key, &data)?;
            // A cluster-wide prefix also matches deeper namespaced keys of the same kind
            if object.key.gvk == *gvk {
                objects.push(object);
            }
        }
        debug!("Listed {} objects of {}", objects.len(), gvk);
        Ok(objects)
    }

    async fn create(&self, mut object: StoredObject) -> Result<StoredObject> {
        let key = object.key.clone();
        info!("Creating object: {}", key);

        let created = self.modify(&key, |current| {
            if current.is_some() {
                return Err(StorageError::Object(TrellisError::object_already_exists(
                    key.to_string(),
                )));
            }
            object.generation = 1;
            object.resource_version = 1;
            object.deletion_timestamp = None;
            Ok(Some(object))
        })?;
        Self::stored(&key, created)
    }

    async fn apply(
        &self,
        key: &ObjectKey,
        spec: serde_json::Value,
        annotations: BTreeMap<String, String>,
    ) -> Result<StoredObject> {
        let applied = self.modify(key, |current| {
            let Some(mut object) = current else {
                info!("Creating object: {}", key);
                let mut object = StoredObject::new(key.clone(), spec);
                object.annotations = annotations;
                object.generation = 1;
                object.resource_version = 1;
                return Ok(Some(object));
            };

            let mut changed = false;
            if object.spec != spec {
                object.spec = spec;
                object.generation += 1;
                changed = true;
            }
            for (name, value) in annotations {
                if object.annotations.get(&name) != Some(&value) {
                    object.annotations.insert(name, value);
                    changed = true;
                }
            }
            if changed {
                object.resource_version += 1;
                debug!(
                    "Applied object {} at generation {}",
                    key, object.generation
                );
            }
            Ok(Some(object))
        })?;
        Self::stored(key, applied)
    }

    async fn update(&self, mut object: StoredObject) -> Result<StoredObject> {
        let key = object.key.clone();
        debug!("Updating object: {}", key);

        let updated = self.modify(&key, |current| {
            let current = Self::existing(&key, current)?;
            if current.resource_version != object.resource_version {
                return Err(StorageError::Object(TrellisError::conflict(
                    key.to_string(),
                    object.resource_version,
                    current.resource_version,
                )));
            }
            if current.spec != object.spec {
                object.generation = current.generation + 1;
            } else {
                object.generation = current.generation;
            }
            object.deletion_timestamp = current.deletion_timestamp;
            object.resource_version = current.resource_version + 1;
            Ok(Some(object))
        })?;
        Self::stored(&key, updated)
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: StatusEnvelope,
    ) -> Result<StoredObject> {
        let updated = self.modify(key, |current| {
            let mut object = Self::existing(key, current)?;
            object.status = status;
            object.resource_version += 1;
            Ok(Some(object))
        })?;
        Self::stored(key, updated)
    }

    async fn annotate(&self, key: &ObjectKey, name: &str, value: &str) -> Result<StoredObject> {
        let updated = self.modify(key, |current| {
            let mut object = Self::existing(key, current)?;
            if object.annotations.get(name).map(String::as_str) != Some(value) {
                object.annotations.insert(name.to_string(), value.to_string());
                object.resource_version += 1;
            }
            Ok(Some(object))
        })?;
        Self::stored(key, updated)
    }

    async fn remove_annotation(&self, key: &ObjectKey, name: &str) -> Result<StoredObject> {
        let updated = self.modify(key, |current| {
            let mut object = Self::existing(key, current)?;
            if object.annotations.remove(name).is_some() {
                object.resource_version += 1;
            }
            Ok(Some(object))
        })?;
        Self::stored(key, updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let mut existed = false;
        self.modify(key, |current| {
            let Some(mut object) = current else {
                return Ok(None);
            };
            existed = true;
            if object.finalizers.is_empty() {
                info!("Deleting object: {}", key);
                return Ok(None);
            }
            if object.deletion_timestamp.is_none() {
                info!(
                    "Marking object {} for deletion, waiting on finalizers {:?}",
                    key, object.finalizers
                );
                object.deletion_timestamp = Some(Utc::now());
                object.resource_version += 1;
            }
            Ok(Some(object))
        })?;
        Ok(existed)
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        self.modify(key, |current| {
            let Some(mut object) = current else {
                return Ok(None);
            };
            let before = object.finalizers.len();
            object.finalizers.retain(|f| f != finalizer);
            if object.finalizers.len() == before {
                return Ok(Some(object));
            }
            if object.finalizers.is_empty() && object.is_terminating() {
                info!("Last finalizer removed, deleting object: {}", key);
                return Ok(None);
            }
            object.resource_version += 1;
            Ok(Some(object))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use serde_json::json;
    use trellis_core::{LastOperationState, LastOperationType};

    fn store() -> KvObjectStore {
        KvObjectStore::new(Arc::new(MemoryBackend::new()))
    }

    fn dns_key(name: &str) -> ObjectKey {
        ObjectKey::new(GroupVersionKind::extension("DNSRecord"), "shoot--dev--a", name)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let key = dns_key("internal");
        let created = store
            .create(StoredObject::new(key.clone(), json!({"name": "api.internal"})))
            .await
            .unwrap();
        assert_eq!(created.generation, 1);
        assert_eq!(created.resource_version, 1);

        let fetched = store.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched, created);

        let err = store
            .create(StoredObject::new(key, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Object(TrellisError::ObjectAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = store();
        let key = dns_key("external");
        let spec = json!({"name": "api.example.com", "values": ["1.2.3.4"]});

        let first = store
            .apply(&key, spec.clone(), BTreeMap::new())
            .await
            .unwrap();
        let second = store.apply(&key, spec, BTreeMap::new()).await.unwrap();
        assert_eq!(first, second);

        let third = store
            .apply(&key, json!({"name": "api.example.com"}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(third.generation, 2);
        assert_eq!(third.resource_version, 2);
    }

    #[tokio::test]
    async fn test_update_detects_conflict() {
        let store = store();
        let key = dns_key("owner");
        let created = store
            .create(StoredObject::new(key.clone(), json!({"v": 1})))
            .await
            .unwrap();

        let mut stale = created.clone();
        let mut fresh = created;
        fresh.spec = json!({"v": 2});
        let fresh = store.update(fresh).await.unwrap();
        assert_eq!(fresh.generation, 2);

        stale.spec = json!({"v": 3});
        let err = store.update(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_status_keeps_generation() {
        let store = store();
        let key = dns_key("internal");
        store
            .apply(&key, json!({"name": "a"}), BTreeMap::new())
            .await
            .unwrap();

        let updated = store
            .update_status(&key, StatusEnvelope::succeeded(LastOperationType::Reconcile, 1))
            .await
            .unwrap();
        assert_eq!(updated.generation, 1);
        assert_eq!(
            updated.status.last_operation_state(),
            Some(LastOperationState::Succeeded)
        );
        assert!(updated.is_observed());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let store = store();
        let gvk = GroupVersionKind::extension("Worker");
        for (ns, name) in [("shoot--a--x", "x"), ("shoot--a--y", "y"), ("shoot--a--y", "z")] {
            store
                .apply(&ObjectKey::new(gvk.clone(), ns, name), json!({}), BTreeMap::new())
                .await
                .unwrap();
        }

        assert_eq!(store.list(&gvk, None).await.unwrap().len(), 3);
        assert_eq!(store.list(&gvk, Some("shoot--a--y")).await.unwrap().len(), 2);
        assert!(store
            .list(&GroupVersionKind::extension("Network"), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let kv: Arc<dyn KVStore> = Arc::new(MemoryBackend::new());
        let seed = KvObjectStore::new(kv.clone());
        let shoot = KvObjectStore::scoped(kv, "shoots/garden-dev/alpha");
        let node = GroupVersionKind::from_api_version_kind("v1", "Node");

        shoot
            .apply(&ObjectKey::cluster_scoped(node.clone(), "n1"), json!({}), BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(shoot.list(&node, None).await.unwrap().len(), 1);
        assert!(seed.list(&node, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_annotations() {
        let store = store();
        let key = dns_key("internal");
        store.apply(&key, json!({}), BTreeMap::new()).await.unwrap();

        let annotated = store.annotate(&key, "trellis.dev/operation", "reconcile").await.unwrap();
        assert_eq!(annotated.pending_operation(), Some("reconcile"));

        let cleared = store.remove_annotation(&key, "trellis.dev/operation").await.unwrap();
        assert_eq!(cleared.pending_operation(), None);

        let again = store.remove_annotation(&key, "trellis.dev/operation").await.unwrap();
        assert_eq!(again.resource_version, cleared.resource_version);
    }

    #[tokio::test]
    async fn test_delete_honours_finalizers() {
        let store = store();
        let key = dns_key("internal");
        assert!(!store.delete(&key).await.unwrap());

        store
            .create(StoredObject::new(key.clone(), json!({})).with_finalizer("extensions.trellis.dev/dns"))
            .await
            .unwrap();

        assert!(store.delete(&key).await.unwrap());
        let terminating = store.get(&key).await.unwrap().unwrap();
        assert!(terminating.is_terminating());

        store
            .remove_finalizer(&key, "extensions.trellis.dev/dns")
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_object_errors() {
        let store = store();
        let err = store
            .update_status(&dns_key("nope"), StatusEnvelope::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Object(TrellisError::ObjectNotFound { .. })
        ));
    }
}
