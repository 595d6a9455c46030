use crate::component::{Component, CredentialConsumer, Scalable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use trellis_core::CredentialClass;
use trellis_flow::{CancellationToken, FlowError, Result};
use trellis_storage::PriorState;

/// A lifecycle call made on a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Deploy,
    DeployWithReplicas(i32),
    RestoreWithReplicas(i32),
    Wait,
    Scale(i32),
    Destroy,
    WaitCleanup,
    Migrate,
    WaitMigrate,
    Restore,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Call::Deploy => write!(f, "Deploy"),
            Call::DeployWithReplicas(n) => write!(f, "Deploy({})", n),
            Call::RestoreWithReplicas(n) => write!(f, "Restore({})", n),
            Call::Wait => write!(f, "Wait"),
            Call::Scale(n) => write!(f, "Scale({})", n),
            Call::Destroy => write!(f, "Destroy"),
            Call::WaitCleanup => write!(f, "WaitCleanup"),
            Call::Migrate => write!(f, "Migrate"),
            Call::WaitMigrate => write!(f, "WaitMigrate"),
            Call::Restore => write!(f, "Restore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub component: String,
    pub call: Call,
    pub succeeded: bool,
}

/// Call log shared by a set of mock components, in the order calls returned
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, component: &str, call: Call, succeeded: bool) {
        self.entries.lock().push(CallRecord {
            component: component.to_string(),
            call,
            succeeded,
        });
    }

    pub fn entries(&self) -> Vec<CallRecord> {
        self.entries.lock().clone()
    }

    /// Calls made on one component, in order
    pub fn calls_of(&self, component: &str) -> Vec<Call> {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.component == component)
            .map(|r| r.call)
            .collect()
    }

    /// Index of the first matching call in the log
    pub fn position(&self, component: &str, call: Call) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|r| r.component == component && r.call == call)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct MockState {
    replicas: Option<i32>,
    failures: HashMap<Call, String>,
    delays: HashMap<Call, Duration>,
    adoption: BTreeMap<CredentialClass, bool>,
}

/// In-memory component recording every lifecycle call
///
/// Calls succeed immediately unless a failure or delay was configured for
/// them. Delayed calls honour cancellation.
pub struct MockComponent {
    name: String,
    desired_replicas: i32,
    log: CallLog,
    state: Mutex<MockState>,
}

impl MockComponent {
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            desired_replicas: 1,
            log,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Desired replica count, and the count of an already existing workload
    pub fn with_replicas(mut self, desired: i32, current: Option<i32>) -> Self {
        self.desired_replicas = desired;
        self.state.get_mut().replicas = current;
        self
    }

    /// Make `call` fail with a severe error
    pub fn fail_on(self, call: Call, message: impl Into<String>) -> Self {
        self.state.lock().failures.insert(call, message.into());
        self
    }

    /// Make `call` take `delay` before returning
    pub fn delay_on(self, call: Call, delay: Duration) -> Self {
        self.state.lock().delays.insert(call, delay);
        self
    }

    pub fn set_adopted(&self, class: CredentialClass, adopted: bool) {
        self.state.lock().adoption.insert(class, adopted);
    }

    pub fn replicas(&self) -> Option<i32> {
        self.state.lock().replicas
    }

    async fn invoke(&self, token: &CancellationToken, call: Call) -> Result<()> {
        let (delay, failure) = {
            let state = self.state.lock();
            (state.delays.get(&call).copied(), state.failures.get(&call).cloned())
        };

        if let Some(delay) = delay {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.log.record(&self.name, call, false);
                    return Err(FlowError::cancelled(format!("{} {}", call, self.name)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(message) = failure {
            self.log.record(&self.name, call, false);
            return Err(FlowError::severe(format!("{} {}", call, self.name), message));
        }

        match call {
            Call::Deploy | Call::Restore => self.state.lock().replicas = Some(self.desired_replicas),
            Call::DeployWithReplicas(n) | Call::RestoreWithReplicas(n) | Call::Scale(n) => {
                self.state.lock().replicas = Some(n)
            }
            Call::Destroy => self.state.lock().replicas = None,
            _ => {}
        }
        debug!(component = %self.name, %call, "Mock call");
        self.log.record(&self.name, call, true);
        Ok(())
    }
}

#[async_trait]
impl Component for MockComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, token: &CancellationToken) -> Result<()> {
        self.invoke(token, Call::Deploy).await
    }

    async fn wait(&self, token: &CancellationToken) -> Result<()> {
        self.invoke(token, Call::Wait).await
    }

    async fn destroy(&self, token: &CancellationToken) -> Result<()> {
        self.invoke(token, Call::Destroy).await
    }

    async fn wait_cleanup(&self, token: &CancellationToken) -> Result<()> {
        self.invoke(token, Call::WaitCleanup).await
    }

    async fn migrate(&self, token: &CancellationToken) -> Result<()> {
        self.invoke(token, Call::Migrate).await
    }

    async fn wait_migrate(&self, token: &CancellationToken) -> Result<()> {
        self.invoke(token, Call::WaitMigrate).await
    }

    async fn restore(&self, token: &CancellationToken, _prior: &PriorState) -> Result<()> {
        self.invoke(token, Call::Restore).await
    }
}

#[async_trait]
impl Scalable for MockComponent {
    fn desired_replicas(&self) -> i32 {
        self.desired_replicas
    }

    async fn current_replicas(&self) -> Result<Option<i32>> {
        Ok(self.state.lock().replicas)
    }

    async fn deploy_with_replicas(&self, token: &CancellationToken, replicas: i32) -> Result<()> {
        self.invoke(token, Call::DeployWithReplicas(replicas)).await
    }

    async fn restore_with_replicas(
        &self,
        token: &CancellationToken,
        replicas: i32,
        _prior: &PriorState,
    ) -> Result<()> {
        self.invoke(token, Call::RestoreWithReplicas(replicas)).await
    }

    async fn scale(&self, token: &CancellationToken, replicas: i32) -> Result<()> {
        self.invoke(token, Call::Scale(replicas)).await
    }
}

#[async_trait]
impl CredentialConsumer for MockComponent {
    async fn credentials_adopted(&self, class: CredentialClass) -> Result<bool> {
        Ok(self.state.lock().adoption.get(&class).copied().unwrap_or(true))
    }
}
