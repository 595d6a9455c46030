// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Trellis operations
#[derive(Error, Debug, Diagnostic)]
pub enum TrellisError {
    /// Object not found in the backing store
    #[error("Object not found: {object_key}")]
    #[diagnostic(
        code(trellis::object_not_found),
        help("Verify the kind, namespace and name are correct. The backing store is eventually consistent, so a freshly written object may not be visible yet")
    )]
    ObjectNotFound {
        #[allow(unused)]
        object_key: String,
    },

    /// Object already exists
    #[error("Object already exists: {object_key}")]
    #[diagnostic(
        code(trellis::object_already_exists),
        help("Apply the object instead of creating it, or delete the existing object first")
    )]
    ObjectAlreadyExists {
        #[allow(unused)]
        object_key: String,
    },

    /// Optimistic concurrency conflict
    #[error("Conflict writing {object_key}: expected resource version {expected}, found {actual}")]
    #[diagnostic(
        code(trellis::conflict),
        help("Another writer modified this object concurrently. Re-read the object and retry the write")
    )]
    Conflict {
        #[allow(unused)]
        object_key: String,
        #[allow(unused)]
        expected: u64,
        #[allow(unused)]
        actual: u64,
    },

    /// Invalid object
    #[error("Invalid object: {reason}")]
    #[diagnostic(code(trellis::invalid_object), help("{suggestion}"))]
    InvalidObject {
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(trellis::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Rotation phase cannot move in the requested direction
    #[error("Invalid rotation transition for {credential}: cannot move from {from} to {to}")]
    #[diagnostic(
        code(trellis::invalid_rotation_transition),
        help("Rotation phases advance None/Completed -> Preparing -> Prepared -> Completing -> Completed")
    )]
    InvalidRotationTransition {
        #[allow(unused)]
        credential: String,
        #[allow(unused)]
        from: String,
        #[allow(unused)]
        to: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(trellis::serialization_error),
        help("Ensure the object format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(trellis::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for Trellis operations
pub type Result<T> = std::result::Result<T, TrellisError>;

impl TrellisError {
    /// Create an ObjectNotFound error
    pub fn object_not_found(object_key: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            object_key: object_key.into(),
        }
    }

    /// Create an ObjectAlreadyExists error
    pub fn object_already_exists(object_key: impl Into<String>) -> Self {
        Self::ObjectAlreadyExists {
            object_key: object_key.into(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(object_key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            object_key: object_key.into(),
            expected,
            actual,
        }
    }

    /// Create an InvalidObject error
    pub fn invalid_object(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidObject {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InvalidRotationTransition error
    pub fn invalid_rotation_transition(
        credential: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidRotationTransition {
            credential: credential.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. })
    }
}
