//! An in-process stand-in for the operators owning managed objects

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use trellis_components::CREDENTIALS_ANNOTATION_PREFIX;
use trellis_core::{
    GroupVersionKind, LastOperationType, StatusEnvelope, StoredObject, OPERATION_MIGRATE,
    OPERATION_RESTORE,
};
use trellis_flow::CancellationToken;
use trellis_storage::ObjectStore;

pub fn managed_kinds() -> Vec<GroupVersionKind> {
    vec![
        GroupVersionKind::extension("Infrastructure"),
        GroupVersionKind::extension("Network"),
        GroupVersionKind::extension("ControlPlane"),
        GroupVersionKind::extension("DNSRecord"),
        GroupVersionKind::extension("OperatingSystemConfig"),
        GroupVersionKind::extension("Worker"),
        GroupVersionKind::control_plane("Etcd"),
        GroupVersionKind::control_plane("TrustBundle"),
        GroupVersionKind::from_api_version_kind("apps/v1", "Deployment"),
    ]
}

/// Picks up every pending operation once a second and reports it succeeded
///
/// Reported state is `{"owner": <name>}` unless the object already carries
/// state. Operating system configs get a rendered cloud-config reference,
/// workloads report the credential generations they were deployed with.
pub struct FakeOperator {
    completed: Arc<Mutex<HashMap<(String, LastOperationType), usize>>>,
}

impl FakeOperator {
    pub fn spawn(store: Arc<dyn ObjectStore>, token: &CancellationToken) -> Self {
        let completed = Arc::new(Mutex::new(HashMap::new()));
        let counts = completed.clone();
        let token = token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        for gvk in managed_kinds() {
                            let Ok(objects) = store.list(&gvk, None).await else {
                                continue;
                            };
                            for object in objects {
                                if let Some(type_) = handle(store.as_ref(), object).await {
                                    *counts.lock().entry((gvk.kind.clone(), type_)).or_insert(0) += 1;
                                }
                            }
                        }
                    }
                }
            }
        });

        Self { completed }
    }

    /// Number of operations of a type completed for a kind
    pub fn completed(&self, gvk: &GroupVersionKind, type_: LastOperationType) -> usize {
        self.completed
            .lock()
            .get(&(gvk.kind.clone(), type_))
            .copied()
            .unwrap_or(0)
    }
}

async fn handle(store: &dyn ObjectStore, object: StoredObject) -> Option<LastOperationType> {
    if object.is_terminating() {
        for finalizer in &object.finalizers {
            store.remove_finalizer(&object.key, finalizer).await.ok()?;
        }
        return None;
    }

    let type_ = match object.pending_operation()? {
        OPERATION_MIGRATE => LastOperationType::Migrate,
        OPERATION_RESTORE => LastOperationType::Restore,
        _ => LastOperationType::Reconcile,
    };

    let mut status = StatusEnvelope::succeeded(type_, object.generation);
    status.state = Some(
        object
            .status
            .state
            .clone()
            .unwrap_or_else(|| json!({"owner": object.key.name})),
    );
    status.provider_status = provider_status(&object);

    store
        .remove_annotation(&object.key, trellis_core::OPERATION_ANNOTATION)
        .await
        .ok()?;
    store.update_status(&object.key, status).await.ok()?;
    Some(type_)
}

fn provider_status(object: &StoredObject) -> Option<serde_json::Value> {
    match object.key.gvk.kind.as_str() {
        "OperatingSystemConfig" => Some(json!({
            "cloudConfig": {"secretRef": {"name": format!("cloud-config-{}", object.key.name)}}
        })),
        "Etcd" => Some(json!({"credentials": object.spec["credentials"]})),
        "Deployment" => {
            let annotations = object
                .spec
                .pointer("/template/metadata/annotations")
                .and_then(|a| a.as_object())?;
            let credentials: serde_json::Map<String, serde_json::Value> = annotations
                .iter()
                .filter_map(|(key, value)| {
                    let class = key.strip_prefix(CREDENTIALS_ANNOTATION_PREFIX)?;
                    let generation: u64 = value.as_str()?.parse().ok()?;
                    Some((class.to_string(), json!(generation)))
                })
                .collect();
            Some(json!({ "credentials": credentials }))
        }
        _ => None,
    }
}
