//! Sequential and concurrent composition of named steps.
//!
//! Groups are plain values: a [`Step`] can itself be a sequential or
//! concurrent group, so whole flows nest as trees. Nothing here owns
//! resources or keeps state between runs.

use crate::error::{FlowError, Result, StepFailure};
use futures_util::future::{join_all, BoxFuture};
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type StepFn<'a> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// A named unit of work receiving the cancellation token of its group
pub struct Step<'a> {
    name: String,
    run: StepFn<'a>,
}

impl<'a> Step<'a> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move |token| -> BoxFuture<'a, Result<()>> { Box::pin(f(token)) }),
        }
    }

    /// A step that does nothing, used where a policy decides no work is needed
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, |_| async { Ok(()) })
    }

    /// Nest a sequential group as a single step
    pub fn sequential(name: impl Into<String>, steps: Vec<Step<'a>>) -> Self {
        let name = name.into();
        let group = name.clone();
        Self::new(name, move |token| async move {
            sequential(&group, &token, steps).await
        })
    }

    /// Nest a concurrent group as a single step
    pub fn concurrent(name: impl Into<String>, steps: Vec<Step<'a>>) -> Self {
        let name = name.into();
        let group = name.clone();
        Self::new(name, move |token| async move {
            concurrent(&group, &token, steps).await
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        (self.run)(token).await
    }
}

impl std::fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// Run steps in order, stopping at the first failure and returning it unchanged
pub async fn sequential(name: &str, token: &CancellationToken, steps: Vec<Step<'_>>) -> Result<()> {
    let start = Instant::now();
    debug!(group = %name, steps = steps.len(), "Running sequential group");

    for step in steps {
        if token.is_cancelled() {
            return Err(FlowError::cancelled(step.name));
        }

        let step_name = step.name.clone();
        let step_start = Instant::now();
        match step.run(token.clone()).await {
            Ok(()) => {
                debug!(
                    group = %name,
                    step = %step_name,
                    elapsed_ms = step_start.elapsed().as_millis() as u64,
                    "Step succeeded"
                );
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(group = %name, step = %step_name, "Step cancelled");
                } else {
                    warn!(group = %name, step = %step_name, error = %e, "Step failed");
                }
                return Err(e);
            }
        }
    }

    debug!(
        group = %name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Sequential group succeeded"
    );
    Ok(())
}

/// Run all steps at once and wait for every one of them
///
/// A failing member does not stop its siblings. Failures are returned
/// together, each tagged with its step name; a group whose members all
/// failed through cancellation reports plain cancellation.
pub async fn concurrent(name: &str, token: &CancellationToken, steps: Vec<Step<'_>>) -> Result<()> {
    if token.is_cancelled() {
        return Err(FlowError::cancelled(name));
    }

    let start = Instant::now();
    debug!(group = %name, steps = steps.len(), "Running concurrent group");

    let names: Vec<String> = steps.iter().map(|s| s.name.clone()).collect();
    let results = join_all(steps.into_iter().map(|step| step.run(token.clone()))).await;

    let failures: Vec<StepFailure> = names
        .into_iter()
        .zip(results)
        .filter_map(|(step, result)| result.err().map(|error| StepFailure { step, error }))
        .collect();

    if failures.is_empty() {
        debug!(
            group = %name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Concurrent group succeeded"
        );
        return Ok(());
    }

    if failures.iter().all(|f| f.error.is_cancelled()) {
        info!(group = %name, "Concurrent group cancelled");
        return Err(FlowError::cancelled(name));
    }

    for failure in &failures {
        warn!(group = %name, step = %failure.step, error = %failure.error, "Group member failed");
    }
    Err(FlowError::aggregated(name, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str, result: Result<()>) -> Step<'static> {
        let log = log.clone();
        Step::new(name, move |_| async move {
            log.lock().await.push(name.to_string());
            result
        })
    }

    #[tokio::test]
    async fn test_sequential_runs_in_order() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        sequential(
            "chain",
            &token,
            vec![
                recording(&log, "a", Ok(())),
                recording(&log, "b", Ok(())),
                recording(&log, "c", Ok(())),
            ],
        )
        .await
        .unwrap();

        assert_eq!(*log.lock().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_sequential_short_circuits() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        let err = sequential(
            "chain",
            &token,
            vec![
                recording(&log, "a", Ok(())),
                recording(&log, "b", Err(FlowError::severe("b", "boom"))),
                recording(&log, "c", Ok(())),
            ],
        )
        .await
        .unwrap_err();

        assert_eq!(*log.lock().await, vec!["a", "b"]);
        assert!(err.is_severe());
        assert_eq!(err.to_string(), FlowError::severe("b", "boom").to_string());
    }

    #[tokio::test]
    async fn test_concurrent_aggregates_all_failures() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        let err = concurrent(
            "group",
            &token,
            vec![
                recording(&log, "a", Err(FlowError::severe("a", "first"))),
                recording(&log, "b", Err(FlowError::timeout("b", Duration::from_secs(1), "second"))),
            ],
        )
        .await
        .unwrap_err();

        match err {
            FlowError::Aggregated { group, failures } => {
                assert_eq!(group, "group");
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].step, "a");
                assert!(failures[0].error.is_severe());
                assert_eq!(failures[1].step, "b");
                assert!(failures[1].error.is_timeout());
            }
            other => panic!("expected aggregated error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waits_for_siblings_of_failed_step() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        let slow_log = log.clone();
        let slow = Step::new("b", move |_| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            slow_log.lock().await.push("b".to_string());
            Ok(())
        });

        let err = concurrent(
            "group",
            &token,
            vec![recording(&log, "a", Err(FlowError::severe("a", "boom"))), slow],
        )
        .await
        .unwrap_err();

        assert_eq!(*log.lock().await, vec!["a", "b"]);
        match err {
            FlowError::Aggregated { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].step, "a");
            }
            other => panic!("expected aggregated error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_concurrent_group_waits_for_members() {
        let token = CancellationToken::new();
        let finished: Log = Arc::default();

        let member = |name: &'static str| {
            let finished = finished.clone();
            Step::new(name, move |token: CancellationToken| async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        // Members still get to record their shutdown
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        finished.lock().await.push(name.to_string());
                        Err(FlowError::cancelled(name))
                    }
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(()),
                }
            })
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = concurrent("group", &token, vec![member("a"), member("b")])
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(matches!(err, FlowError::Cancelled { .. }));
        assert_eq!(finished.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_nested_groups() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        let flow = Step::sequential(
            "flow",
            vec![
                Step::concurrent(
                    "prerequisites",
                    vec![recording(&log, "etcd", Ok(())), recording(&log, "dns", Ok(()))],
                ),
                recording(&log, "apiserver", Ok(())),
            ],
        );
        assert_eq!(flow.name(), "flow");
        flow.run(token).await.unwrap();

        let log = log.lock().await;
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], "apiserver");
    }

    #[tokio::test]
    async fn test_sequential_stops_when_cancelled() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        let cancel = token.clone();
        let first = Step::new("a", move |_| async move {
            cancel.cancel();
            Ok(())
        });

        let err = sequential("chain", &token, vec![first, recording(&log, "b", Ok(()))])
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(log.lock().await.is_empty());
    }
}
