//! Trellis Core - Fundamental types for the Trellis shoot control-plane orchestrator
//!
//! This crate provides:
//! - Object keys addressing the backing store
//! - The generic status envelope reported by operators
//! - Phase flags (reconciliation, hibernation, credential rotation)
//! - The Shoot desired-state model
//! - Error types with miette diagnostics
//! - Serialization helpers

pub mod error;
pub mod object;
pub mod phases;
pub mod shoot;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TrellisError};
pub use object::{
    StoredObject, OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RECONCILE,
    OPERATION_RESTORE,
};
pub use phases::{
    CredentialClass, HibernationState, PhaseFlags, ReconciliationPhase, RotationPhase,
};
pub use shoot::{RotationRequest, Shoot, ShootSpec, ShootStatus, WorkerPool};
pub use status::{
    ErrorCode, LastError, LastOperation, LastOperationState, LastOperationType, StatusEnvelope,
};
pub use types::{GroupVersionKind, ObjectKey};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;

/// Serialize a value to JSON
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        TrellisError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        TrellisError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Convert a typed value into an opaque JSON value
pub fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| {
        TrellisError::serialization_error(
            format!("Failed to convert to JSON value: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Convert an opaque JSON value into a typed value
pub fn from_value<T: for<'de> serde::Deserialize<'de>>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        TrellisError::serialization_error(
            format!("Failed to convert from JSON value: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a value to YAML
pub fn to_yaml<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| {
        TrellisError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from YAML
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        TrellisError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_shoot_spec() {
        let yaml = r#"
seedName: seed-a
kubernetesVersion: "1.31.2"
provider:
  type: aws
  workers:
    - name: pool-a
      machineType: m5.large
      minimum: 1
      maximum: 3
hibernation: false
"#;
        let spec: ShootSpec = from_yaml(yaml).unwrap();
        assert_eq!(spec.provider.workers.len(), 1);
        assert_eq!(spec.provider.workers[0].machine_type, "m5.large");

        let back = to_yaml(&spec).unwrap();
        assert!(back.contains("seedName: seed-a"));
    }

    #[test]
    fn test_json_invalid_input() {
        let result: Result<ShootSpec> = from_json("{not json");
        assert!(matches!(
            result,
            Err(TrellisError::SerializationError { .. })
        ));
    }
}
