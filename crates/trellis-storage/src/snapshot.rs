use crate::{KVStore, KeyEncoder, Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use trellis_core::ObjectKey;

/// State captured from the source seed before a control-plane migration
///
/// Maps the storage key of every migrated resource to the opaque
/// `status.state` its operator reported. Consumed by restore on the
/// destination seed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorState {
    pub resources: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl PriorState {
    pub fn new() -> Self {
        Self {
            resources: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, key: &ObjectKey, state: serde_json::Value) {
        self.resources.insert(key.storage_key(), state);
    }

    /// Captured state of one resource
    pub fn state_of(&self, key: &ObjectKey) -> Option<&serde_json::Value> {
        self.resources.get(&key.storage_key())
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Persistence for [`PriorState`] snapshots, one per shoot
#[derive(Clone)]
pub struct SnapshotStore {
    kv: Arc<dyn KVStore>,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    pub fn save(&self, shoot: &ObjectKey, state: &PriorState) -> Result<()> {
        let key = KeyEncoder::encode_snapshot_key(shoot);
        let data = serde_json::to_vec(state)?;
        self.kv.put(key.as_bytes(), &data)?;
        info!(
            "Saved prior state of {} with {} resources",
            shoot,
            state.resources.len()
        );
        Ok(())
    }

    pub fn load(&self, shoot: &ObjectKey) -> Result<Option<PriorState>> {
        let key = KeyEncoder::encode_snapshot_key(shoot);
        match self.kv.get(key.as_bytes())? {
            Some(data) => {
                let state = serde_json::from_slice(&data).map_err(|e| {
                    StorageError::serialization_error(
                        format!("Failed to decode prior state of {}: {}", shoot, e),
                        Some(Box::new(e)),
                    )
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, shoot: &ObjectKey) -> Result<()> {
        let key = KeyEncoder::encode_snapshot_key(shoot);
        self.kv.delete(key.as_bytes())?;
        info!("Deleted prior state of {}", shoot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use serde_json::json;
    use trellis_core::{GroupVersionKind, Shoot};

    #[test]
    fn test_snapshot_lifecycle() {
        let snapshots = SnapshotStore::new(Arc::new(MemoryBackend::new()));
        let shoot = Shoot::key_for("garden-dev", "alpha");
        assert!(snapshots.load(&shoot).unwrap().is_none());

        let infra = ObjectKey::new(
            GroupVersionKind::extension("Infrastructure"),
            "shoot--dev--alpha",
            "alpha",
        );
        let mut state = PriorState::new();
        state.insert(&infra, json!({"vpcId": "vpc-123"}));
        snapshots.save(&shoot, &state).unwrap();

        let loaded = snapshots.load(&shoot).unwrap().unwrap();
        assert_eq!(loaded.state_of(&infra), Some(&json!({"vpcId": "vpc-123"})));

        snapshots.delete(&shoot).unwrap();
        assert!(snapshots.load(&shoot).unwrap().is_none());
    }
}
