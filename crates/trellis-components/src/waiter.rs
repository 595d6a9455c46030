//! Readiness waiting on objects that report operator status.

use std::sync::Arc;
use tracing::debug;
use trellis_core::{LastOperationState, LastOperationType, ObjectKey, StoredObject};
use trellis_flow::{
    poll, CancellationToken, FlowError, PollConfig, ProbeContext, Result, TaskOutcome,
};
use trellis_storage::ObjectStore;

/// Which successful last-operation types satisfy a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Create, reconcile, restore or delete
    Ready,
    Migrated,
}

impl Expect {
    fn accepts(&self, type_: LastOperationType) -> bool {
        match self {
            Expect::Ready => type_ != LastOperationType::Migrate,
            Expect::Migrated => type_ == LastOperationType::Migrate,
        }
    }
}

/// Polls objects in the backing store until their operator reports an outcome
#[derive(Clone)]
pub struct ReadinessWaiter {
    store: Arc<dyn ObjectStore>,
}

impl ReadinessWaiter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Wait until the operator reports the latest spec as successfully handled
    ///
    /// A missing object is retried until the severe threshold, absorbing
    /// store lag right after a write. A still-present operation annotation
    /// or an unobserved generation counts as pending. An operator error
    /// fails immediately. On success `extract` runs on the object and its
    /// value is returned.
    pub async fn wait_ready<T, F>(
        &self,
        token: &CancellationToken,
        key: &ObjectKey,
        config: &PollConfig,
        extract: F,
    ) -> Result<T>
    where
        T: Send,
        F: Fn(&StoredObject) -> Result<T> + Send + Sync,
    {
        let operation = format!("wait for {}", key);
        let extract = &extract;
        let operation_name = operation.as_str();
        poll(token, &operation, config, move |ctx| {
            self.probe_ready(ctx, key, operation_name, extract)
        })
        .await
    }

    /// Wait until the operator reports a successful migration
    ///
    /// An absent object has nothing left to hand off and counts as migrated.
    pub async fn wait_migrated(
        &self,
        token: &CancellationToken,
        key: &ObjectKey,
        config: &PollConfig,
    ) -> Result<()> {
        let operation = format!("wait for migration of {}", key);
        let store = &self.store;
        poll(token, &operation, config, move |_| async move {
            match store.get(key).await {
                Ok(None) => {
                    debug!(resource = %key, "Object absent, nothing to migrate");
                    TaskOutcome::Done(())
                }
                Ok(Some(object)) => match classify(&object, Expect::Migrated) {
                    Ok(()) => TaskOutcome::Done(()),
                    Err(outcome) => outcome,
                },
                Err(e) => TaskOutcome::retry(format!("failed to read object: {}", e)),
            }
        })
        .await
    }

    /// Wait until the object is gone
    ///
    /// Errors reported while deleting are retried until the timeout, since
    /// deletion may still converge.
    pub async fn wait_deleted(
        &self,
        token: &CancellationToken,
        key: &ObjectKey,
        config: &PollConfig,
    ) -> Result<()> {
        let operation = format!("wait for deletion of {}", key);
        let store = &self.store;
        poll(token, &operation, config, move |_| async move {
            match store.get(key).await {
                Ok(None) => TaskOutcome::Done(()),
                Ok(Some(object)) => match &object.status.last_error {
                    Some(err) if object.status.last_operation_state().is_some_and(|s| s.is_error()) => {
                        TaskOutcome::retry(format!("deletion reported an error: {}", err.description))
                    }
                    _ if object.is_terminating() => TaskOutcome::retry(format!(
                        "still terminating, waiting on finalizers {:?}",
                        object.finalizers
                    )),
                    _ => TaskOutcome::retry("still present"),
                },
                Err(e) => TaskOutcome::retry(format!("failed to read object: {}", e)),
            }
        })
        .await
    }

    async fn probe_ready<T, F>(
        &self,
        ctx: ProbeContext,
        key: &ObjectKey,
        operation: &str,
        extract: &F,
    ) -> TaskOutcome<T>
    where
        F: Fn(&StoredObject) -> Result<T> + Send + Sync,
    {
        let object = match self.store.get(key).await {
            Ok(Some(object)) => object,
            Ok(None) => return ctx.retry_or_escalate(operation, "object not found"),
            Err(e) => return TaskOutcome::retry(format!("failed to read object: {}", e)),
        };

        if let Err(outcome) = classify(&object, Expect::Ready) {
            return outcome;
        }
        match extract(&object) {
            Ok(value) => TaskOutcome::Done(value),
            Err(e) => TaskOutcome::FailNow(e),
        }
    }
}

/// Ok(()) when the object is in the expected final state, otherwise the
/// outcome to report for this probe
///
/// Non-final states retry until the timeout; only a missing object escalates.
fn classify<T>(object: &StoredObject, expect: Expect) -> std::result::Result<(), TaskOutcome<T>> {
    if let Some(op) = object.pending_operation() {
        return Err(TaskOutcome::retry(format!(
            "operation '{}' not yet picked up by the operator",
            op
        )));
    }
    if !object.is_observed() {
        return Err(TaskOutcome::retry(format!(
            "generation {} not yet observed (observed {:?})",
            object.generation, object.status.observed_generation
        )));
    }

    let Some(last) = &object.status.last_operation else {
        return Err(TaskOutcome::retry("status not yet populated"));
    };

    match last.state {
        LastOperationState::Succeeded if expect.accepts(last.type_) => Ok(()),
        state if state.is_error() => {
            let (description, codes) = match &object.status.last_error {
                Some(err) => (err.description.clone(), err.codes.clone()),
                None => (last.description.clone(), Vec::new()),
            };
            Err(TaskOutcome::FailNow(FlowError::operator_error(
                object.key.to_string(),
                description,
                codes,
            )))
        }
        state => Err(TaskOutcome::retry(format!(
            "last operation {} is {}",
            last.type_, state
        ))),
    }
}
