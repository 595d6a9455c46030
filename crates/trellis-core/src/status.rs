use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of the operation last performed on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

impl fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LastOperationType::Create => "Create",
            LastOperationType::Reconcile => "Reconcile",
            LastOperationType::Delete => "Delete",
            LastOperationType::Migrate => "Migrate",
            LastOperationType::Restore => "Restore",
        };
        write!(f, "{}", s)
    }
}

/// State of the operation last performed on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    Pending,
    Processing,
    Succeeded,
    Error,
    Failed,
    Aborted,
}

impl LastOperationState {
    /// Whether the operator gave up on the object
    pub fn is_error(&self) -> bool {
        matches!(self, LastOperationState::Error | LastOperationState::Failed)
    }
}

impl fmt::Display for LastOperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LastOperationState::Pending => "Pending",
            LastOperationState::Processing => "Processing",
            LastOperationState::Succeeded => "Succeeded",
            LastOperationState::Error => "Error",
            LastOperationState::Failed => "Failed",
            LastOperationState::Aborted => "Aborted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    pub state: LastOperationState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub progress: u8,
    pub last_update_time: DateTime<Utc>,
}

impl LastOperation {
    pub fn new(
        type_: LastOperationType,
        state: LastOperationState,
        description: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            state,
            description: description.into(),
            progress: if state == LastOperationState::Succeeded {
                100
            } else {
                0
            },
            last_update_time: Utc::now(),
        }
    }
}

/// Machine-readable classification attached to an operator-reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    QuotaExceeded,
    ConfigurationProblem,
    DependenciesNotReady,
    RetryableInfraDependencies,
}

impl ErrorCode {
    /// Codes the end user has to act on; retrying will not help
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unauthorized | ErrorCode::QuotaExceeded | ErrorCode::ConfigurationProblem
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Unauthorized => "ERR_UNAUTHORIZED",
            ErrorCode::QuotaExceeded => "ERR_QUOTA_EXCEEDED",
            ErrorCode::ConfigurationProblem => "ERR_CONFIGURATION_PROBLEM",
            ErrorCode::DependenciesNotReady => "ERR_DEPENDENCIES_NOT_READY",
            ErrorCode::RetryableInfraDependencies => "ERR_RETRYABLE_INFRA_DEPENDENCIES",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<ErrorCode>,
    pub last_update_time: DateTime<Utc>,
}

impl LastError {
    pub fn new(description: impl Into<String>, codes: Vec<ErrorCode>) -> Self {
        Self {
            description: description.into(),
            codes,
            last_update_time: Utc::now(),
        }
    }
}

/// Generic status envelope reported by the operator that owns an object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Operator-owned state carried across seeds on migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    /// Operator output consumed by other components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
}

impl StatusEnvelope {
    pub fn last_operation_state(&self) -> Option<LastOperationState> {
        self.last_operation.as_ref().map(|op| op.state)
    }

    pub fn last_operation_type(&self) -> Option<LastOperationType> {
        self.last_operation.as_ref().map(|op| op.type_)
    }

    /// Status as an operator writes it after finishing an operation
    pub fn succeeded(type_: LastOperationType, observed_generation: i64) -> Self {
        Self {
            last_operation: Some(LastOperation::new(
                type_,
                LastOperationState::Succeeded,
                format!("{} succeeded", type_),
            )),
            observed_generation: Some(observed_generation),
            ..Default::default()
        }
    }

    /// Status as an operator writes it after giving up on an operation
    pub fn errored(
        type_: LastOperationType,
        observed_generation: i64,
        description: impl Into<String>,
        codes: Vec<ErrorCode>,
    ) -> Self {
        let description = description.into();
        Self {
            last_operation: Some(LastOperation::new(
                type_,
                LastOperationState::Error,
                description.clone(),
            )),
            last_error: Some(LastError::new(description, codes)),
            observed_generation: Some(observed_generation),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_envelope_wire_format() {
        let status = StatusEnvelope::succeeded(LastOperationType::Reconcile, 2);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["lastOperation"]["type"], "Reconcile");
        assert_eq!(json["lastOperation"]["state"], "Succeeded");
        assert_eq!(json["observedGeneration"], 2);
        assert!(json.get("lastError").is_none());
    }

    #[test]
    fn test_user_error_codes() {
        assert!(ErrorCode::QuotaExceeded.is_user_error());
        assert!(!ErrorCode::DependenciesNotReady.is_user_error());
        assert_eq!(ErrorCode::Unauthorized.to_string(), "ERR_UNAUTHORIZED");
    }

    #[test]
    fn test_error_states() {
        assert!(LastOperationState::Error.is_error());
        assert!(LastOperationState::Failed.is_error());
        assert!(!LastOperationState::Processing.is_error());
    }
}
