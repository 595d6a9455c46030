// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use trellis_core::{ErrorCode, TrellisError};
use trellis_storage::StorageError;

/// A named member of a concurrent group that failed
#[derive(Debug)]
pub struct StepFailure {
    pub step: String,
    pub error: FlowError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Error type for polling and task composition
#[derive(Error, Debug, Diagnostic)]
pub enum FlowError {
    /// A condition that should have resolved quickly persisted, or a probe hit
    /// something it cannot recover from
    #[error("{operation} failed: {message}")]
    #[diagnostic(
        code(trellis::flow::severe),
        help("This failure is not retried within the current pass. Inspect the named resource and its operator")
    )]
    Severe {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        message: String,
    },

    /// The deadline passed while the probe still reported a transient condition
    #[error("{operation} timed out after {timeout:?}: {last_cause}")]
    #[diagnostic(
        code(trellis::flow::timeout),
        help("The last transient condition is shown above. Increase the timeout for this resource kind if convergence is simply slow")
    )]
    Timeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        timeout: Duration,
        #[allow(unused)]
        last_cause: String,
    },

    /// The surrounding pass was cancelled
    #[error("{operation} was cancelled")]
    #[diagnostic(
        code(trellis::flow::cancelled),
        help("Cancellation is not a reconciliation failure. The next pass picks the work up again")
    )]
    Cancelled {
        #[allow(unused)]
        operation: String,
    },

    /// The owning operator reported an error in the status envelope
    #[error("Operator reported an error for {resource}: {description}")]
    #[diagnostic(code(trellis::flow::operator_error), help("{hint}"))]
    OperatorError {
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        description: String,
        #[allow(unused)]
        codes: Vec<ErrorCode>,
        #[allow(unused)]
        hint: String,
    },

    /// One or more members of a concurrent group failed
    #[error("{} of group {group} failed: {}", failures.len(), render_failures(failures))]
    #[diagnostic(
        code(trellis::flow::aggregated),
        help("Each failing step is listed with its own error")
    )]
    Aggregated {
        #[allow(unused)]
        group: String,
        #[allow(unused)]
        failures: Vec<StepFailure>,
    },

    /// Object-level error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] TrellisError),

    /// Backing store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
}

fn render_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}]", f))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

impl FlowError {
    /// Create a Severe error
    pub fn severe(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Severe {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(
        operation: impl Into<String>,
        timeout: Duration,
        last_cause: impl Into<String>,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
            last_cause: last_cause.into(),
        }
    }

    /// Create a Cancelled error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an OperatorError, pointing at the user when an error code says so
    pub fn operator_error(
        resource: impl Into<String>,
        description: impl Into<String>,
        codes: Vec<ErrorCode>,
    ) -> Self {
        let user_codes: Vec<String> = codes
            .iter()
            .filter(|c| c.is_user_error())
            .map(|c| c.to_string())
            .collect();
        let hint = if user_codes.is_empty() {
            "Check the logs of the operator owning this resource".to_string()
        } else {
            format!(
                "The operator classified this as a user error ({}). Fix the shoot configuration or cloud account, retrying will not help",
                user_codes.join(", ")
            )
        };
        Self::OperatorError {
            resource: resource.into(),
            description: description.into(),
            codes,
            hint,
        }
    }

    /// Create an Aggregated error
    pub fn aggregated(group: impl Into<String>, failures: Vec<StepFailure>) -> Self {
        Self::Aggregated {
            group: group.into(),
            failures,
        }
    }

    /// Whether this error stems only from cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            FlowError::Cancelled { .. } => true,
            FlowError::Aggregated { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_cancelled())
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FlowError::Timeout { .. })
    }

    pub fn is_severe(&self) -> bool {
        matches!(self, FlowError::Severe { .. })
    }

    /// Error codes reported by operators anywhere in this error
    pub fn error_codes(&self) -> Vec<ErrorCode> {
        match self {
            FlowError::OperatorError { codes, .. } => codes.clone(),
            FlowError::Aggregated { failures, .. } => {
                let mut codes: Vec<ErrorCode> = Vec::new();
                for failure in failures {
                    for code in failure.error.error_codes() {
                        if !codes.contains(&code) {
                            codes.push(code);
                        }
                    }
                }
                codes
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_lists_every_step() {
        let err = FlowError::aggregated(
            "prerequisites",
            vec![
                StepFailure {
                    step: "etcd".to_string(),
                    error: FlowError::severe("wait etcd", "not found"),
                },
                StepFailure {
                    step: "dns".to_string(),
                    error: FlowError::operator_error("dns", "zone missing", vec![]),
                },
            ],
        );
        let message = err.to_string();
        assert!(message.contains("2 of group prerequisites failed"));
        assert!(message.contains("[etcd: wait etcd failed: not found]"));
        assert!(message.contains("[dns: Operator reported an error for dns: zone missing]"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(FlowError::cancelled("wait").is_cancelled());

        let all_cancelled = FlowError::aggregated(
            "group",
            vec![StepFailure {
                step: "a".to_string(),
                error: FlowError::cancelled("a"),
            }],
        );
        assert!(all_cancelled.is_cancelled());
        assert!(!FlowError::aggregated("group", vec![]).is_cancelled());
    }

    #[test]
    fn test_operator_error_codes() {
        let err = FlowError::aggregated(
            "extensions",
            vec![
                StepFailure {
                    step: "infrastructure".to_string(),
                    error: FlowError::operator_error(
                        "infrastructure",
                        "quota exceeded",
                        vec![ErrorCode::QuotaExceeded],
                    ),
                },
                StepFailure {
                    step: "worker".to_string(),
                    error: FlowError::operator_error(
                        "worker",
                        "quota exceeded",
                        vec![ErrorCode::QuotaExceeded, ErrorCode::Unauthorized],
                    ),
                },
            ],
        );
        assert_eq!(
            err.error_codes(),
            vec![ErrorCode::QuotaExceeded, ErrorCode::Unauthorized]
        );

        match FlowError::operator_error("worker", "denied", vec![ErrorCode::Unauthorized]) {
            FlowError::OperatorError { hint, .. } => assert!(hint.contains("user error")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
