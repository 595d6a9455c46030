//! Repeated probing until a condition holds, fails, or the deadline passes.
//!
//! The poller is the only place in trellis that retries. Probes report the
//! instantaneous state as a [`TaskOutcome`]; deadline enforcement and
//! cancellation are handled here.

use crate::config::PollConfig;
use crate::error::{FlowError, Result};
use crate::outcome::{ProbeContext, TaskOutcome};
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Invoke `probe` immediately and then every `config.interval` until it
/// reports `Done` or `FailNow`, the timeout elapses, or `token` is cancelled.
///
/// A timeout carries the last `RetryLater` cause. The deadline and
/// cancellation are both observed while the probe runs and while sleeping.
pub async fn poll<T, F, Fut>(
    token: &CancellationToken,
    operation: &str,
    config: &PollConfig,
    mut probe: F,
) -> Result<T>
where
    F: FnMut(ProbeContext) -> Fut,
    Fut: Future<Output = TaskOutcome<T>>,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut attempt = 0u32;
    let mut last_cause = String::from("no probe completed");

    loop {
        if token.is_cancelled() {
            return Err(FlowError::cancelled(operation));
        }

        attempt += 1;
        let ctx = ProbeContext {
            attempt,
            elapsed: start.elapsed(),
            severe_threshold: config.severe_threshold,
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FlowError::cancelled(operation)),
            outcome = tokio::time::timeout_at(deadline, probe(ctx)) => outcome,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    last_cause = %last_cause,
                    "Probe still running at deadline"
                );
                return Err(FlowError::timeout(operation, config.timeout, last_cause));
            }
        };

        let cause = match outcome {
            TaskOutcome::Done(value) => {
                debug!(
                    operation = %operation,
                    attempt = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Condition satisfied"
                );
                return Ok(value);
            }
            TaskOutcome::FailNow(err) => {
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    error = %err,
                    "Probe failed"
                );
                return Err(err);
            }
            TaskOutcome::RetryLater(cause) => cause,
        };

        let now = Instant::now();
        if now >= deadline {
            warn!(
                operation = %operation,
                attempt = attempt,
                last_cause = %cause,
                "Timed out waiting"
            );
            return Err(FlowError::timeout(operation, config.timeout, cause));
        }

        debug!(
            operation = %operation,
            attempt = attempt,
            cause = %cause,
            "Condition not yet satisfied, retrying"
        );
        last_cause = cause;

        // The final probe runs at the deadline, not an interval past it
        let pause = config.interval.min(deadline - now);
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FlowError::cancelled(operation)),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
