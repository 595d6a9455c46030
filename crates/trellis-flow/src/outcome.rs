use crate::error::FlowError;
use std::time::Duration;

/// What a probe observed on one invocation
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The condition holds; polling stops with this value
    Done(T),
    /// Not there yet; the cause is kept for the timeout error
    RetryLater(String),
    /// Unrecoverable; polling stops with this error
    FailNow(FlowError),
}

impl<T> TaskOutcome<T> {
    pub fn retry(cause: impl Into<String>) -> Self {
        TaskOutcome::RetryLater(cause.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done(_))
    }
}

/// Information handed to a probe on every invocation
#[derive(Debug, Clone, Copy)]
pub struct ProbeContext {
    /// 1-based invocation counter
    pub attempt: u32,
    /// Time since polling started
    pub elapsed: Duration,
    pub severe_threshold: Duration,
}

impl ProbeContext {
    /// Whether a condition observed now has persisted past the severe threshold
    pub fn past_severe_threshold(&self) -> bool {
        self.elapsed > self.severe_threshold
    }

    /// Retry a condition that should resolve quickly, failing once it has
    /// persisted past the severe threshold
    pub fn retry_or_escalate<T>(
        &self,
        operation: &str,
        cause: impl Into<String>,
    ) -> TaskOutcome<T> {
        let cause = cause.into();
        if self.past_severe_threshold() {
            TaskOutcome::FailNow(FlowError::severe(
                operation,
                format!("{} (persisted for {:?})", cause, self.elapsed),
            ))
        } else {
            TaskOutcome::RetryLater(cause)
        }
    }
}
