use crate::status::StatusEnvelope;
use crate::types::ObjectKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation asking the owning operator to perform an operation
pub const OPERATION_ANNOTATION: &str = "trellis.dev/operation";
pub const OPERATION_RECONCILE: &str = "reconcile";
pub const OPERATION_MIGRATE: &str = "migrate";
pub const OPERATION_RESTORE: &str = "restore";

/// An object as held by the backing store
///
/// `spec` is the opaque desired state written by a component; `status` is
/// written asynchronously by whichever operator owns the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub key: ObjectKey,
    /// Bumped on every spec change
    pub generation: i64,
    /// Bumped on every write, used for optimistic concurrency
    pub resource_version: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Operators holding back removal until their cleanup has finished
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Set once deletion was requested while finalizers were still present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: StatusEnvelope,
}

impl StoredObject {
    /// A not-yet-persisted object; the store assigns versions on create
    pub fn new(key: ObjectKey, spec: serde_json::Value) -> Self {
        Self {
            key,
            generation: 0,
            resource_version: 0,
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
            spec,
            status: StatusEnvelope::default(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizers.push(finalizer.into());
        self
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Pending operation requested from the operator, if any
    pub fn pending_operation(&self) -> Option<&str> {
        self.annotations.get(OPERATION_ANNOTATION).map(String::as_str)
    }

    /// Whether the operator has observed the latest spec
    pub fn is_observed(&self) -> bool {
        self.status
            .observed_generation
            .is_some_and(|observed| observed >= self.generation)
    }
}
