//! Hibernation and wake-up of a shoot's control plane
//!
//! The control plane is only scaled down once the shoot has no nodes, no
//! running pods and no endpoints in its pod network. The preconditions are
//! checked in strict order, each with its own deadline, and nothing is scaled
//! until all of them hold.

use k8s_openapi::api::core::v1::{Endpoints, Pod};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};
use trellis_components::Scalable;
use trellis_core::{GroupVersionKind, StoredObject, TrellisError};
use trellis_flow::{poll, CancellationToken, FlowError, PollConfig, Result, Step, TaskOutcome};
use trellis_storage::ObjectStore;

/// Deadlines of the hibernation preconditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HibernationConfig {
    /// How long to wait for all nodes to be removed
    pub node_wait: Duration,
    /// How long to wait for running pods to stop
    pub pod_wait: Duration,
    /// How long to wait for endpoints in the pod network to be released
    pub endpoint_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            node_wait: Duration::from_secs(10 * 60),
            pod_wait: Duration::from_secs(5 * 60),
            endpoint_wait: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

fn node_gvk() -> GroupVersionKind {
    GroupVersionKind::from_api_version_kind("v1", "Node")
}

fn pod_gvk() -> GroupVersionKind {
    GroupVersionKind::from_api_version_kind("v1", "Pod")
}

fn endpoints_gvk() -> GroupVersionKind {
    GroupVersionKind::from_api_version_kind("v1", "Endpoints")
}

fn volume_attachment_gvk() -> GroupVersionKind {
    GroupVersionKind::from_api_version_kind("storage.k8s.io/v1", "VolumeAttachment")
}

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Cidr {
    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            !((1u32 << (32 - self.prefix_len)) - 1)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(addr) & mask == u32::from(self.network) & mask
    }
}

/// Parse a CIDR string like "100.96.0.0/11"
pub fn parse_cidr(cidr_str: &str) -> std::result::Result<Cidr, TrellisError> {
    let (network, prefix) = cidr_str.split_once('/').ok_or_else(|| {
        TrellisError::invalid_config(
            format!("Invalid CIDR format: '{}'", cidr_str),
            "Use format like '100.96.0.0/11'",
        )
    })?;

    let network: Ipv4Addr = network.parse().map_err(|_| {
        TrellisError::invalid_config(
            format!("Invalid network address: '{}'", network),
            "Use a valid IPv4 address like '100.96.0.0'",
        )
    })?;

    let prefix_len: u8 = prefix.parse().map_err(|_| {
        TrellisError::invalid_config(
            format!("Invalid prefix length: '{}'", prefix),
            "Use a number between 0 and 32",
        )
    })?;

    if prefix_len > 32 {
        return Err(TrellisError::invalid_config(
            format!("Prefix length {} is out of range", prefix_len),
            "Use a number between 0 and 32",
        ));
    }

    Ok(Cidr {
        network,
        prefix_len,
    })
}

/// Poll `probe` until it reports done, turning a missed deadline into a
/// severe error
async fn wait_until<F, Fut>(
    token: &CancellationToken,
    operation: &str,
    interval: Duration,
    timeout: Duration,
    probe: F,
) -> Result<()>
where
    F: FnMut(trellis_flow::ProbeContext) -> Fut,
    Fut: std::future::Future<Output = TaskOutcome<()>>,
{
    let config = PollConfig::new(interval, timeout, timeout);
    poll(token, operation, &config, probe).await.map_err(|e| match e {
        FlowError::Timeout { last_cause, .. } => FlowError::severe(
            operation,
            format!("not satisfied within {:?}: {}", timeout, last_cause),
        ),
        other => other,
    })
}

async fn list(cluster: &dyn ObjectStore, gvk: &GroupVersionKind) -> std::result::Result<Vec<StoredObject>, String> {
    cluster
        .list(gvk, None)
        .await
        .map_err(|e| format!("listing {}: {}", gvk.kind, e))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(object: &StoredObject) -> Option<T> {
    match serde_json::from_value(object.spec.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(resource = %object.key, error = %e, "Skipping undecodable object");
            None
        }
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

fn addresses_in(endpoints: &Endpoints, cidr: &Cidr) -> usize {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|address| address.ip.parse::<Ipv4Addr>().ok())
        .filter(|ip| cidr.contains(*ip))
        .count()
}

pub async fn wait_for_no_nodes(
    token: &CancellationToken,
    cluster: &dyn ObjectStore,
    config: &HibernationConfig,
) -> Result<()> {
    let gvk = node_gvk();
    wait_until(token, "wait for nodes to be removed", config.poll_interval, config.node_wait, |_| {
        let gvk = &gvk;
        async move {
            match list(cluster, gvk).await {
                Ok(nodes) if nodes.is_empty() => TaskOutcome::Done(()),
                Ok(nodes) => TaskOutcome::retry(format!("{} nodes still registered", nodes.len())),
                Err(cause) => TaskOutcome::retry(cause),
            }
        }
    })
    .await
}

pub async fn wait_for_no_running_pods(
    token: &CancellationToken,
    cluster: &dyn ObjectStore,
    config: &HibernationConfig,
) -> Result<()> {
    let gvk = pod_gvk();
    wait_until(token, "wait for pods to stop", config.poll_interval, config.pod_wait, |_| {
        let gvk = &gvk;
        async move {
            let pods = match list(cluster, gvk).await {
                Ok(pods) => pods,
                Err(cause) => return TaskOutcome::retry(cause),
            };
            let running = pods
                .iter()
                .filter_map(decode::<Pod>)
                .filter(is_running)
                .count();
            if running == 0 {
                TaskOutcome::Done(())
            } else {
                TaskOutcome::retry(format!("{} pods still running", running))
            }
        }
    })
    .await
}

pub async fn wait_for_no_pod_endpoints(
    token: &CancellationToken,
    cluster: &dyn ObjectStore,
    pod_cidr: &Cidr,
    config: &HibernationConfig,
) -> Result<()> {
    let gvk = endpoints_gvk();
    wait_until(
        token,
        "wait for endpoints to be released",
        config.poll_interval,
        config.endpoint_wait,
        |_| {
            let gvk = &gvk;
            async move {
                let endpoints = match list(cluster, gvk).await {
                    Ok(endpoints) => endpoints,
                    Err(cause) => return TaskOutcome::retry(cause),
                };
                let addresses: usize = endpoints
                    .iter()
                    .filter_map(decode::<Endpoints>)
                    .map(|e| addresses_in(&e, pod_cidr))
                    .sum();
                if addresses == 0 {
                    TaskOutcome::Done(())
                } else {
                    TaskOutcome::retry(format!(
                        "{} endpoint addresses still in pod network",
                        addresses
                    ))
                }
            }
        },
    )
    .await
}

/// Delete every volume attachment without waiting for its detachment
pub async fn force_delete_volume_attachments(cluster: &dyn ObjectStore) -> Result<usize> {
    let attachments = cluster.list(&volume_attachment_gvk(), None).await?;
    let count = attachments.len();
    for attachment in attachments {
        cluster.delete(&attachment.key).await?;
        for finalizer in &attachment.finalizers {
            cluster.remove_finalizer(&attachment.key, finalizer).await?;
        }
        debug!(resource = %attachment.key, "Force deleted volume attachment");
    }
    if count > 0 {
        info!(count, "Force deleted remaining volume attachments");
    }
    Ok(count)
}

/// Scale a workload and wait for it; a workload that does not exist is
/// created with the target count, or left alone when scaling to zero
async fn scale_and_wait<C>(component: &C, token: &CancellationToken, replicas: i32) -> Result<()>
where
    C: Scalable + ?Sized,
{
    match component.current_replicas().await? {
        None if replicas == 0 => {
            debug!(component = %component.name(), "Absent, nothing to scale down");
            return Ok(());
        }
        None => component.deploy_with_replicas(token, replicas).await?,
        Some(_) => component.scale(token, replicas).await?,
    }
    component.wait(token).await
}

fn scale_group<'a>(name: &str, components: Vec<&'a dyn Scalable>, replicas: impl Fn(&dyn Scalable) -> i32) -> Step<'a> {
    Step::concurrent(
        name,
        components
            .into_iter()
            .map(|component| {
                let target = replicas(component);
                Step::new(
                    format!("scale {} to {}", component.name(), target),
                    move |token| async move { scale_and_wait(component, &token, target).await },
                )
            })
            .collect(),
    )
}

/// Steps taking an awake control plane into hibernation
///
/// Strictly sequential: no nodes, no running pods, no endpoints in the pod
/// network, force-delete volume attachments. Then the control-plane
/// deployments are scaled to zero concurrently, and the store cluster last.
pub fn hibernate<'a>(
    config: &'a HibernationConfig,
    cluster: &'a dyn ObjectStore,
    pod_cidr: Cidr,
    deployments: Vec<&'a dyn Scalable>,
    stores: Vec<&'a dyn Scalable>,
) -> Step<'a> {
    Step::sequential(
        "hibernate",
        vec![
            Step::new("wait for nodes to be removed", move |token| async move {
                wait_for_no_nodes(&token, cluster, config).await
            }),
            Step::new("wait for pods to stop", move |token| async move {
                wait_for_no_running_pods(&token, cluster, config).await
            }),
            Step::new("wait for endpoints to be released", move |token| async move {
                wait_for_no_pod_endpoints(&token, cluster, &pod_cidr, config).await
            }),
            Step::new("force delete volume attachments", move |_| async move {
                force_delete_volume_attachments(cluster).await.map(|_| ())
            }),
            scale_group("scale down control plane", deployments, |_| 0),
            scale_group("scale down etcd", stores, |_| 0),
        ],
    )
}

/// Steps bringing a hibernated control plane back: the store cluster first,
/// then the deployments talking to it
pub fn wake_up<'a>(stores: Vec<&'a dyn Scalable>, deployments: Vec<&'a dyn Scalable>) -> Step<'a> {
    Step::sequential(
        "wake up",
        vec![
            scale_group("scale up etcd", stores, |c| c.desired_replicas()),
            scale_group("scale up control plane", deployments, |c| c.desired_replicas()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use trellis_components::{Call, CallLog, MockComponent};
    use trellis_core::ObjectKey;
    use trellis_storage::{KvObjectStore, MemoryBackend};

    fn cluster() -> KvObjectStore {
        KvObjectStore::scoped(Arc::new(MemoryBackend::new()), "shoots/garden-dev/alpha")
    }

    async fn add(cluster: &KvObjectStore, gvk: GroupVersionKind, namespace: &str, name: &str, object: serde_json::Value) {
        let key = if namespace.is_empty() {
            ObjectKey::cluster_scoped(gvk, name)
        } else {
            ObjectKey::new(gvk, namespace, name)
        };
        cluster.create(StoredObject::new(key, object)).await.unwrap();
    }

    fn workloads(log: &CallLog) -> (MockComponent, MockComponent, MockComponent) {
        (
            MockComponent::new("kube-apiserver", log.clone()).with_replicas(2, Some(2)),
            MockComponent::new("kube-controller-manager", log.clone()).with_replicas(1, Some(1)),
            MockComponent::new("etcd-main", log.clone()).with_replicas(3, Some(3)),
        )
    }

    #[test]
    fn test_parse_cidr() {
        let cidr = parse_cidr("100.96.0.0/11").unwrap();
        assert!(cidr.contains("100.96.0.1".parse().unwrap()));
        assert!(cidr.contains("100.127.255.254".parse().unwrap()));
        assert!(!cidr.contains("100.128.0.1".parse().unwrap()));
        assert!(parse_cidr("0.0.0.0/0").unwrap().contains("8.8.8.8".parse().unwrap()));

        assert!(parse_cidr("100.96.0.0").is_err());
        assert!(parse_cidr("100.96.0.0/33").is_err());
        assert!(parse_cidr("not-an-ip/8").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hibernation_order() {
        let cluster = cluster();
        add(
            &cluster,
            volume_attachment_gvk(),
            "",
            "csi-1",
            json!({"spec": {"attacher": "ebs.csi.aws.com", "nodeName": "n-1", "source": {}}}),
        )
        .await;

        let log = CallLog::new();
        let (apiserver, kcm, etcd) = workloads(&log);
        let config = HibernationConfig::default();

        hibernate(
            &config,
            &cluster,
            parse_cidr("100.96.0.0/11").unwrap(),
            vec![&apiserver, &kcm],
            vec![&etcd],
        )
        .run(CancellationToken::new())
        .await
        .unwrap();

        assert!(cluster.list(&volume_attachment_gvk(), None).await.unwrap().is_empty());

        let etcd_scale = log.position("etcd-main", Call::Scale(0)).unwrap();
        assert!(log.position("kube-apiserver", Call::Wait).unwrap() < etcd_scale);
        assert!(log.position("kube-controller-manager", Call::Wait).unwrap() < etcd_scale);
        assert_eq!(etcd.replicas(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_node_aborts_without_scaling() {
        let cluster = cluster();
        add(&cluster, node_gvk(), "", "n-1", json!({"metadata": {"name": "n-1"}})).await;

        let log = CallLog::new();
        let (apiserver, kcm, etcd) = workloads(&log);
        let config = HibernationConfig::default();

        let start = tokio::time::Instant::now();
        let err = hibernate(
            &config,
            &cluster,
            parse_cidr("100.96.0.0/11").unwrap(),
            vec![&apiserver, &kcm],
            vec![&etcd],
        )
        .run(CancellationToken::new())
        .await
        .unwrap_err();

        assert!(err.is_severe());
        assert!(start.elapsed() >= config.node_wait);
        assert!(log.is_empty());
        assert_eq!(apiserver.replicas(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_pod_blocks_until_stopped() {
        let cluster = Arc::new(cluster());
        add(
            &cluster,
            pod_gvk(),
            "kube-system",
            "coredns-0",
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "coredns-0"}, "status": {"phase": "Running"}}),
        )
        .await;
        add(
            &cluster,
            pod_gvk(),
            "default",
            "job-1",
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "job-1"}, "status": {"phase": "Succeeded"}}),
        )
        .await;

        let stopper = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let key = ObjectKey::new(pod_gvk(), "kube-system", "coredns-0");
            stopper.delete(&key).await.unwrap();
        });

        let config = HibernationConfig::default();
        let start = tokio::time::Instant::now();
        wait_for_no_running_pods(&CancellationToken::new(), cluster.as_ref(), &config)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < config.pod_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoints_outside_pod_network_are_ignored() {
        let cluster = cluster();
        add(
            &cluster,
            endpoints_gvk(),
            "default",
            "kubernetes",
            json!({"apiVersion": "v1", "kind": "Endpoints", "subsets": [{"addresses": [{"ip": "10.250.0.10"}]}]}),
        )
        .await;
        let cidr = parse_cidr("100.96.0.0/11").unwrap();
        let config = HibernationConfig::default();

        wait_for_no_pod_endpoints(&CancellationToken::new(), &cluster, &cidr, &config)
            .await
            .unwrap();

        add(
            &cluster,
            endpoints_gvk(),
            "kube-system",
            "metrics",
            json!({"apiVersion": "v1", "kind": "Endpoints", "subsets": [{"addresses": [{"ip": "100.96.1.4"}]}]}),
        )
        .await;
        let err = wait_for_no_pod_endpoints(&CancellationToken::new(), &cluster, &cidr, &config)
            .await
            .unwrap_err();
        assert!(err.is_severe());
    }

    #[tokio::test]
    async fn test_wake_up_order() {
        let log = CallLog::new();
        let apiserver = MockComponent::new("kube-apiserver", log.clone()).with_replicas(2, Some(0));
        let etcd = MockComponent::new("etcd-main", log.clone()).with_replicas(3, Some(0));

        wake_up(vec![&etcd], vec![&apiserver])
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(log.calls_of("etcd-main"), vec![Call::Scale(3), Call::Wait]);
        assert!(
            log.position("etcd-main", Call::Wait).unwrap()
                < log.position("kube-apiserver", Call::Scale(2)).unwrap()
        );
    }
}
