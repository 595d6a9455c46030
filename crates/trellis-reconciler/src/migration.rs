//! Hand-off of a control plane from one seed to another
//!
//! The source seed migrates every extension (the operators stop managing
//! the resources without deleting what they created), captures the state the
//! operators reported into a snapshot and then removes its own copy of the
//! control plane. The destination seed later restores from that snapshot.

use tracing::info;
use trellis_components::{destroy_step, migrate_step, Component};
use trellis_core::ObjectKey;
use trellis_flow::{Result, Step};
use trellis_storage::{ObjectStore, PriorState, SnapshotStore};

/// Migrate all components concurrently and wait until every one is migrated
pub fn migrate_all<'a>(components: Vec<&'a dyn Component>) -> Step<'a> {
    Step::concurrent(
        "migrate extensions",
        components.into_iter().map(migrate_step).collect(),
    )
}

/// Destroy all components concurrently and wait until every one is gone
pub fn destroy_all<'a>(name: &str, components: Vec<&'a dyn Component>) -> Step<'a> {
    Step::concurrent(name, components.into_iter().map(destroy_step).collect())
}

/// Collect the operator state of the given objects
///
/// Objects that are absent or carry no state are left out.
pub async fn capture_prior_state(store: &dyn ObjectStore, keys: &[ObjectKey]) -> Result<PriorState> {
    let mut prior = PriorState::new();
    for key in keys {
        if let Some(state) = store.get(key).await?.and_then(|object| object.status.state) {
            prior.insert(key, state);
        }
    }
    Ok(prior)
}

/// Step capturing the operator state and persisting it for the shoot
pub fn persist_prior_state<'a>(
    store: &'a dyn ObjectStore,
    snapshots: &'a SnapshotStore,
    shoot: &'a ObjectKey,
    keys: Vec<ObjectKey>,
) -> Step<'a> {
    Step::new("persist prior state", move |_| async move {
        let prior = capture_prior_state(store, &keys).await?;
        info!(shoot = %shoot, resources = prior.resources.len(), "Captured prior state");
        snapshots.save(shoot, &prior)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOperator;
    use serde_json::json;
    use std::sync::Arc;
    use trellis_components::{deploy_and_wait, ComponentContext, Extension};
    use trellis_core::{GroupVersionKind, LastOperationType, Shoot};
    use trellis_flow::{sequential, CancellationToken, TimeoutConfig};
    use trellis_storage::{KvObjectStore, MemoryBackend};

    #[tokio::test(start_paused = true)]
    async fn test_migration_captures_state_and_removes_objects() {
        let kv = Arc::new(MemoryBackend::new());
        let store: Arc<dyn ObjectStore> = Arc::new(KvObjectStore::new(kv.clone()));
        let snapshots = SnapshotStore::new(kv);
        let ctx = ComponentContext::new(store.clone(), TimeoutConfig::default());
        let token = CancellationToken::new();
        let operator = FakeOperator::spawn(store.clone(), &token);

        let namespace = "shoot--dev--alpha";
        let infra = Extension::new(&ctx, "Infrastructure", namespace, "alpha", json!({"region": "eu-1"}));
        let network = Extension::new(&ctx, "Network", namespace, "alpha", json!({"type": "calico"}));
        deploy_and_wait(&infra, &token).await.unwrap();
        deploy_and_wait(&network, &token).await.unwrap();

        let shoot = Shoot::key_for("garden-dev", "alpha");
        let keys = vec![infra.key().clone(), network.key().clone()];
        sequential(
            "migrate",
            &token,
            vec![
                migrate_all(vec![&infra, &network]),
                persist_prior_state(store.as_ref(), &snapshots, &shoot, keys.clone()),
                destroy_all("destroy extensions", vec![&infra, &network]),
            ],
        )
        .await
        .unwrap();

        let prior = snapshots.load(&shoot).unwrap().unwrap();
        assert_eq!(prior.resources.len(), 2);
        assert_eq!(prior.state_of(infra.key()), Some(&json!({"owner": "alpha"})));
        assert!(store.get(infra.key()).await.unwrap().is_none());
        assert_eq!(
            operator.completed(&GroupVersionKind::extension("Network"), LastOperationType::Migrate),
            1
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_capture_skips_objects_without_state() {
        let store = KvObjectStore::new(Arc::new(MemoryBackend::new()));
        let present = ObjectKey::new(GroupVersionKind::extension("Worker"), "shoot--dev--a", "a");
        let absent = ObjectKey::new(GroupVersionKind::extension("Network"), "shoot--dev--a", "a");
        store
            .create(trellis_core::StoredObject::new(present.clone(), json!({})))
            .await
            .unwrap();

        let prior = capture_prior_state(&store, &[present, absent]).await.unwrap();
        assert!(prior.is_empty());
    }
}
