//! The Shoot desired-state input and its reconciliation bookkeeping

use crate::error::{Result, TrellisError};
use crate::object::StoredObject;
use crate::phases::{
    CredentialClass, HibernationState, PhaseFlags, ReconciliationPhase, RotationPhase,
};
use crate::status::{LastOperation, LastOperationState, LastOperationType};
use crate::types::{GroupVersionKind, ObjectKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DNS provider type meaning "the user manages records themselves"
pub const UNMANAGED_DNS_PROVIDER: &str = "unmanaged";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    pub name: String,
    pub machine_type: String,
    pub minimum: i32,
    pub maximum: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub workers: Vec<WorkerPool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub pods: String,
    pub services: String,
}

impl Default for NetworkingSpec {
    fn default() -> Self {
        Self {
            type_: "calico".to_string(),
            pods: "100.96.0.0/11".to_string(),
            services: "100.64.0.0/13".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSpec {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Run etcd as a three member cluster
    #[serde(default)]
    pub high_availability: bool,
    #[serde(default = "default_apiserver_replicas")]
    pub kube_apiserver_replicas: i32,
}

fn default_apiserver_replicas() -> i32 {
    2
}

impl Default for ControlPlaneSpec {
    fn default() -> Self {
        Self {
            high_availability: false,
            kube_apiserver_replicas: default_apiserver_replicas(),
        }
    }
}

impl ControlPlaneSpec {
    pub fn etcd_replicas(&self) -> i32 {
        if self.high_availability {
            3
        } else {
            1
        }
    }
}

/// User request driving a credential rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationRequest {
    Start,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    pub seed_name: String,
    #[serde(default)]
    pub kubernetes_version: String,
    #[serde(default)]
    pub provider: ProviderSpec,
    #[serde(default)]
    pub networking: NetworkingSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSpec>,
    #[serde(default)]
    pub control_plane: ControlPlaneSpec,
    #[serde(default)]
    pub hibernation: bool,
    #[serde(default)]
    pub credentials_rotation: BTreeMap<CredentialClass, RotationRequest>,
    #[serde(default)]
    pub deletion_requested: bool,
}

/// Bookkeeping written back by the controller after each pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// Seed currently hosting the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
    #[serde(default)]
    pub hibernated: bool,
    #[serde(default)]
    pub rotation: BTreeMap<CredentialClass, RotationPhase>,
    /// Generation of the credentials currently in use, per class
    #[serde(default)]
    pub credential_generations: BTreeMap<CredentialClass, u32>,
}

impl ShootStatus {
    /// Current credential generation of a class, starting at 1
    pub fn credential_generation(&self, class: CredentialClass) -> u32 {
        self.credential_generations.get(&class).copied().unwrap_or(1)
    }
}

/// A shoot as read from the backing store
#[derive(Debug, Clone, PartialEq)]
pub struct Shoot {
    pub key: ObjectKey,
    pub generation: i64,
    pub resource_version: u64,
    pub spec: ShootSpec,
    pub status: ShootStatus,
    pub last_operation: Option<LastOperation>,
}

impl Shoot {
    pub fn key_for(namespace: &str, name: &str) -> ObjectKey {
        ObjectKey::new(GroupVersionKind::shoot(), namespace, name)
    }

    /// Decode a shoot from its stored representation
    ///
    /// The spec lives in `spec`, the trellis-owned bookkeeping in `status.state`.
    pub fn from_object(object: &StoredObject) -> Result<Self> {
        let spec: ShootSpec = serde_json::from_value(object.spec.clone()).map_err(|e| {
            TrellisError::serialization_error(
                format!("Failed to decode shoot spec of {}: {}", object.key, e),
                Some(Box::new(e)),
            )
        })?;

        let status: ShootStatus = match &object.status.state {
            Some(state) => serde_json::from_value(state.clone()).map_err(|e| {
                TrellisError::serialization_error(
                    format!("Failed to decode shoot status of {}: {}", object.key, e),
                    Some(Box::new(e)),
                )
            })?,
            None => ShootStatus::default(),
        };

        Ok(Self {
            key: object.key.clone(),
            generation: object.generation,
            resource_version: object.resource_version,
            spec,
            status,
            last_operation: object.status.last_operation.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Namespace in the seed that hosts this shoot's control plane
    pub fn technical_namespace(&self) -> String {
        let project = self
            .key
            .namespace
            .strip_prefix("garden-")
            .unwrap_or(&self.key.namespace);
        format!("shoot--{}--{}", project, self.key.name)
    }

    /// Choose the kind of pass the shoot needs next
    pub fn next_operation(&self) -> LastOperationType {
        if self.spec.deletion_requested {
            return LastOperationType::Delete;
        }

        let last = self
            .last_operation
            .as_ref()
            .map(|op| (op.type_, op.state));

        // An unfinished restore keeps restoring until it succeeds
        if let Some((LastOperationType::Restore, state)) = last {
            if state != LastOperationState::Succeeded {
                return LastOperationType::Restore;
            }
        }

        match &self.status.seed_name {
            None => LastOperationType::Create,
            Some(current) if current != &self.spec.seed_name => match last {
                Some((LastOperationType::Migrate, LastOperationState::Succeeded)) => {
                    LastOperationType::Restore
                }
                _ => LastOperationType::Migrate,
            },
            Some(_) => LastOperationType::Reconcile,
        }
    }

    /// Phase flags for a pass of the given kind
    pub fn phase_flags(&self, operation: LastOperationType) -> PhaseFlags {
        let reconciliation = if operation == LastOperationType::Restore {
            ReconciliationPhase::Restoring
        } else {
            ReconciliationPhase::Normal
        };

        let (needs_internal_dns, needs_external_dns) = match &self.spec.dns {
            Some(dns) => (
                true,
                dns.provider.as_deref() != Some(UNMANAGED_DNS_PROVIDER),
            ),
            None => (false, false),
        };

        PhaseFlags {
            reconciliation,
            hibernation: HibernationState::from_flags(
                self.spec.hibernation,
                self.status.hibernated,
            ),
            rotation: self.status.rotation.clone(),
            needs_internal_dns,
            needs_external_dns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusEnvelope;
    use serde_json::json;

    fn shoot_object(spec: serde_json::Value, status: Option<ShootStatus>) -> StoredObject {
        let mut obj = StoredObject::new(Shoot::key_for("garden-dev", "alpha"), spec);
        obj.generation = 1;
        obj.status = StatusEnvelope {
            state: status.map(|s| serde_json::to_value(s).unwrap()),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn test_decode_shoot() {
        let obj = shoot_object(
            json!({
                "seedName": "seed-a",
                "networking": {"type": "cilium", "pods": "10.1.0.0/16", "services": "10.2.0.0/16"},
                "dns": {"domain": "alpha.dev.example.com"},
                "controlPlane": {"highAvailability": true},
                "credentialsRotation": {"certificateAuthorities": "Start"}
            }),
            None,
        );
        let shoot = Shoot::from_object(&obj).unwrap();
        assert_eq!(shoot.spec.seed_name, "seed-a");
        assert_eq!(shoot.spec.control_plane.etcd_replicas(), 3);
        assert_eq!(shoot.spec.control_plane.kube_apiserver_replicas, 2);
        assert_eq!(
            shoot.spec.credentials_rotation[&CredentialClass::CertificateAuthorities],
            RotationRequest::Start
        );
        assert_eq!(shoot.technical_namespace(), "shoot--dev--alpha");
    }

    #[test]
    fn test_decode_rejects_bad_spec() {
        let obj = shoot_object(json!({"seedName": 42}), None);
        assert!(Shoot::from_object(&obj).is_err());
    }

    #[test]
    fn test_next_operation() {
        let obj = shoot_object(json!({"seedName": "seed-a"}), None);
        let mut shoot = Shoot::from_object(&obj).unwrap();
        assert_eq!(shoot.next_operation(), LastOperationType::Create);

        shoot.status.seed_name = Some("seed-a".to_string());
        assert_eq!(shoot.next_operation(), LastOperationType::Reconcile);

        shoot.spec.seed_name = "seed-b".to_string();
        assert_eq!(shoot.next_operation(), LastOperationType::Migrate);

        shoot.last_operation = Some(LastOperation::new(
            LastOperationType::Migrate,
            LastOperationState::Succeeded,
            "",
        ));
        assert_eq!(shoot.next_operation(), LastOperationType::Restore);

        // A failed restore is resumed even after the seed name was updated
        shoot.status.seed_name = Some("seed-b".to_string());
        shoot.last_operation = Some(LastOperation::new(
            LastOperationType::Restore,
            LastOperationState::Error,
            "etcd not ready",
        ));
        assert_eq!(shoot.next_operation(), LastOperationType::Restore);

        shoot.spec.deletion_requested = true;
        assert_eq!(shoot.next_operation(), LastOperationType::Delete);
    }

    #[test]
    fn test_phase_flags() {
        let obj = shoot_object(
            json!({
                "seedName": "seed-a",
                "hibernation": true,
                "dns": {"domain": "alpha.example.com", "provider": "unmanaged"}
            }),
            Some(ShootStatus {
                seed_name: Some("seed-a".to_string()),
                hibernated: false,
                rotation: BTreeMap::from([(
                    CredentialClass::CertificateAuthorities,
                    RotationPhase::Preparing,
                )]),
                ..Default::default()
            }),
        );
        let shoot = Shoot::from_object(&obj).unwrap();
        let flags = shoot.phase_flags(LastOperationType::Reconcile);
        assert_eq!(flags.reconciliation, ReconciliationPhase::Normal);
        assert_eq!(flags.hibernation, HibernationState::Hibernating);
        assert!(flags.needs_internal_dns);
        assert!(!flags.needs_external_dns);
        assert_eq!(
            flags.rotation(CredentialClass::CertificateAuthorities),
            RotationPhase::Preparing
        );

        let flags = shoot.phase_flags(LastOperationType::Restore);
        assert!(flags.is_restoring());
    }
}
