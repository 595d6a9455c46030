//! Trellis Flow - Polling and task composition
//!
//! This crate provides:
//! - The [`TaskOutcome`] a probe reports on each invocation
//! - The poller, the single place where transient conditions are retried
//! - Sequential and concurrent step groups with cancellation
//! - The [`FlowError`] taxonomy shared by every layer above

pub mod composer;
pub mod config;
pub mod error;
pub mod outcome;
pub mod poller;

pub use composer::{concurrent, sequential, Step};
pub use config::{PollConfig, PollSettings, TimeoutConfig};
pub use error::{FlowError, Result, StepFailure};
pub use outcome::{ProbeContext, TaskOutcome};
pub use poller::poll;

// Re-exported so callers share one token type
pub use tokio_util::sync::CancellationToken;
