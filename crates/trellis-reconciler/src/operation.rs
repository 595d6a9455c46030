use crate::hibernation::{self, parse_cidr, HibernationConfig};
use crate::migration::{destroy_all, migrate_all, persist_prior_state};
use crate::policy::{deploy_or_destroy, deploy_or_restore, replicas_for, rotation_gated, scale_then_restore};
use crate::rotation::{signing_generation, trust_bundle, wait_until_adopted};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use trellis_components::{
    destroy_step, dns_record, Component, ComponentContext, ControlPlaneDeployment, CredentialConsumer,
    CredentialGenerations, DeploymentValues, DnsRecordPurpose, Etcd, EtcdValues, Extension,
    OperatingSystemConfig, Scalable, TrustBundle, Worker,
};
use trellis_core::{
    CredentialClass, LastOperationType, ObjectKey, PhaseFlags, RotationPhase, Shoot,
};
use trellis_flow::{CancellationToken, Result, Step};
use trellis_storage::{KVStore, KvObjectStore, ObjectStore, PriorState, SnapshotStore};

pub const KUBE_APISERVER: &str = "kube-apiserver";
pub const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";
pub const KUBE_SCHEDULER: &str = "kube-scheduler";
pub const ETCD_MAIN: &str = "etcd-main";
pub const ETCD_EVENTS: &str = "etcd-events";

/// Workloads that authenticate with, or verify, material of a credential class
pub fn dependents(class: CredentialClass) -> &'static [&'static str] {
    match class {
        CredentialClass::CertificateAuthorities => &[
            KUBE_APISERVER,
            KUBE_CONTROLLER_MANAGER,
            KUBE_SCHEDULER,
            ETCD_MAIN,
            ETCD_EVENTS,
        ],
        CredentialClass::ServiceAccountKey => &[KUBE_APISERVER, KUBE_CONTROLLER_MANAGER],
        CredentialClass::EtcdEncryptionKey => &[KUBE_APISERVER],
    }
}

/// Objects of the shoot cluster itself (nodes, pods, ...), kept apart from
/// the seed's objects
pub fn shoot_cluster(kv: Arc<dyn KVStore>, shoot: &ObjectKey) -> KvObjectStore {
    KvObjectStore::scoped(kv, format!("shoots/{}/{}", shoot.namespace, shoot.name))
}

/// Rotation phase and current generation of every credential class
pub type RotationPlan = BTreeMap<CredentialClass, (RotationPhase, u32)>;

fn rotation_plan(shoot: &Shoot, flags: &PhaseFlags) -> RotationPlan {
    CredentialClass::ALL
        .into_iter()
        .map(|class| {
            (
                class,
                (flags.rotation(class), shoot.status.credential_generation(class)),
            )
        })
        .collect()
}

fn credentials_for(consumer: &str, plan: &RotationPlan) -> CredentialGenerations {
    plan.iter()
        .filter(|(class, _)| dependents(**class).contains(&consumer))
        .map(|(class, (phase, generation))| (*class, signing_generation(*phase, *generation)))
        .collect()
}

/// Every component making up one shoot's control plane, built for one pass
pub struct ShootComponents {
    pub infrastructure: Extension,
    pub network: Extension,
    pub control_plane: Extension,
    pub internal_dns: Extension,
    pub external_dns: Extension,
    pub etcd_main: Etcd,
    pub etcd_events: Etcd,
    pub kube_apiserver: ControlPlaneDeployment,
    pub kube_controller_manager: ControlPlaneDeployment,
    pub kube_scheduler: ControlPlaneDeployment,
    pub trust_bundles: BTreeMap<CredentialClass, Vec<TrustBundle>>,
    pub operating_system_configs: Vec<Arc<OperatingSystemConfig>>,
    pub worker: Worker,
}

impl ShootComponents {
    pub fn new(ctx: &ComponentContext, shoot: &Shoot, flags: &PhaseFlags) -> Self {
        let namespace = shoot.technical_namespace();
        let spec = &shoot.spec;
        let plan = rotation_plan(shoot, flags);
        let apiserver_host = format!("{}.{}.svc.cluster.local", KUBE_APISERVER, namespace);

        let deployment = |name: &str, replicas: i32| {
            ControlPlaneDeployment::new(
                ctx,
                &namespace,
                name,
                DeploymentValues {
                    replicas: replicas_for(flags.hibernation, replicas),
                    image: format!("registry.k8s.io/{}:v{}", name, spec.kubernetes_version),
                    args: Vec::new(),
                    credentials: credentials_for(name, &plan),
                },
            )
        };

        let trust_bundles = CredentialClass::ALL
            .into_iter()
            .map(|class| {
                let (phase, generation) = plan[&class];
                let bundles = dependents(class)
                    .iter()
                    .map(|dependent| {
                        TrustBundle::new(
                            ctx,
                            &namespace,
                            dependent,
                            class,
                            trust_bundle(phase, generation),
                            signing_generation(phase, generation),
                        )
                    })
                    .collect();
                (class, bundles)
            })
            .collect();

        let operating_system_configs: Vec<Arc<OperatingSystemConfig>> = spec
            .provider
            .workers
            .iter()
            .map(|pool| {
                Arc::new(OperatingSystemConfig::new(
                    ctx,
                    &namespace,
                    pool,
                    &spec.kubernetes_version,
                ))
            })
            .collect();

        Self {
            infrastructure: Extension::new(
                ctx,
                "Infrastructure",
                &namespace,
                shoot.name(),
                json!({"type": spec.provider.type_}),
            ),
            network: Extension::new(
                ctx,
                "Network",
                &namespace,
                shoot.name(),
                json!({
                    "type": spec.networking.type_,
                    "podCIDR": spec.networking.pods,
                    "serviceCIDR": spec.networking.services,
                }),
            ),
            control_plane: Extension::new(
                ctx,
                "ControlPlane",
                &namespace,
                shoot.name(),
                json!({"type": spec.provider.type_, "purpose": "normal"}),
            ),
            internal_dns: dns_record(
                ctx,
                &namespace,
                shoot.name(),
                DnsRecordPurpose::Internal,
                spec.dns.as_ref(),
                &apiserver_host,
            ),
            external_dns: dns_record(
                ctx,
                &namespace,
                shoot.name(),
                DnsRecordPurpose::External,
                spec.dns.as_ref(),
                &apiserver_host,
            ),
            etcd_main: Etcd::new(
                ctx,
                &namespace,
                "main",
                EtcdValues {
                    replicas: replicas_for(flags.hibernation, spec.control_plane.etcd_replicas()),
                    backup_bucket: Some(format!("{}--{}", shoot.key.namespace, shoot.name())),
                    credentials: credentials_for(ETCD_MAIN, &plan),
                    ..Default::default()
                },
            ),
            etcd_events: Etcd::new(
                ctx,
                &namespace,
                "events",
                EtcdValues {
                    replicas: replicas_for(flags.hibernation, 1),
                    credentials: credentials_for(ETCD_EVENTS, &plan),
                    ..Default::default()
                },
            ),
            kube_apiserver: deployment(KUBE_APISERVER, spec.control_plane.kube_apiserver_replicas),
            kube_controller_manager: deployment(KUBE_CONTROLLER_MANAGER, 1),
            kube_scheduler: deployment(KUBE_SCHEDULER, 1),
            trust_bundles,
            worker: Worker::new(
                ctx,
                &namespace,
                shoot.name(),
                spec.provider.workers.clone(),
                operating_system_configs.clone(),
                flags.hibernation.is_requested(),
            ),
            operating_system_configs,
        }
    }

    /// Provider extensions, whose operators hold state worth migrating
    pub fn extensions(&self) -> Vec<&dyn Component> {
        let mut extensions: Vec<&dyn Component> = vec![
            &self.infrastructure,
            &self.network,
            &self.control_plane,
            &self.internal_dns,
            &self.external_dns,
        ];
        extensions.extend(
            self.operating_system_configs
                .iter()
                .map(|osc| &**osc as &dyn Component),
        );
        extensions.push(&self.worker);
        extensions
    }

    pub fn extension_keys(&self) -> Vec<ObjectKey> {
        let mut keys = vec![
            self.infrastructure.key().clone(),
            self.network.key().clone(),
            self.control_plane.key().clone(),
            self.internal_dns.key().clone(),
            self.external_dns.key().clone(),
        ];
        keys.extend(
            self.operating_system_configs
                .iter()
                .map(|osc| osc.key().clone()),
        );
        keys.push(self.worker.key().clone());
        keys
    }

    /// Components that only exist in the seed hosting the control plane
    pub fn seed_local(&self) -> Vec<&dyn Component> {
        let mut components: Vec<&dyn Component> = vec![
            &self.etcd_main,
            &self.etcd_events,
            &self.kube_apiserver,
            &self.kube_controller_manager,
            &self.kube_scheduler,
        ];
        components.extend(self.all_bundles());
        components
    }

    pub fn stores(&self) -> Vec<&dyn Scalable> {
        vec![&self.etcd_main, &self.etcd_events]
    }

    pub fn deployments(&self) -> Vec<&dyn Scalable> {
        vec![
            &self.kube_apiserver,
            &self.kube_controller_manager,
            &self.kube_scheduler,
        ]
    }

    pub fn consumers(&self, class: CredentialClass) -> Vec<&dyn CredentialConsumer> {
        let all: [(&str, &dyn CredentialConsumer); 5] = [
            (KUBE_APISERVER, &self.kube_apiserver),
            (KUBE_CONTROLLER_MANAGER, &self.kube_controller_manager),
            (KUBE_SCHEDULER, &self.kube_scheduler),
            (ETCD_MAIN, &self.etcd_main),
            (ETCD_EVENTS, &self.etcd_events),
        ];
        all.into_iter()
            .filter(|(name, _)| dependents(class).contains(name))
            .map(|(_, consumer)| consumer)
            .collect()
    }

    pub fn bundles(&self, class: CredentialClass) -> Vec<&dyn Component> {
        self.trust_bundles
            .get(&class)
            .map(|bundles| bundles.iter().map(|b| b as &dyn Component).collect())
            .unwrap_or_default()
    }

    fn all_bundles(&self) -> impl Iterator<Item = &dyn Component> {
        self.trust_bundles
            .values()
            .flatten()
            .map(|b| b as &dyn Component)
    }
}

/// One pass over one shoot
pub struct ShootOperation {
    shoot: Shoot,
    flags: PhaseFlags,
    ctx: ComponentContext,
    cluster: Arc<dyn ObjectStore>,
    snapshots: SnapshotStore,
    hibernation: HibernationConfig,
    components: ShootComponents,
}

impl ShootOperation {
    pub fn new(
        shoot: Shoot,
        operation: LastOperationType,
        ctx: ComponentContext,
        cluster: Arc<dyn ObjectStore>,
        snapshots: SnapshotStore,
        hibernation: HibernationConfig,
    ) -> Self {
        let flags = shoot.phase_flags(operation);
        let components = ShootComponents::new(&ctx, &shoot, &flags);
        Self {
            shoot,
            flags,
            ctx,
            cluster,
            snapshots,
            hibernation,
            components,
        }
    }

    pub fn flags(&self) -> &PhaseFlags {
        &self.flags
    }

    pub fn components(&self) -> &ShootComponents {
        &self.components
    }

    /// Run the flow of the given operation type
    pub async fn run(&self, token: &CancellationToken, operation: LastOperationType) -> Result<()> {
        match operation {
            LastOperationType::Create | LastOperationType::Reconcile => self.reconcile(token).await,
            LastOperationType::Restore => self.restore(token).await,
            LastOperationType::Migrate => self.migrate(token).await,
            LastOperationType::Delete => self.delete(token).await,
        }
    }

    pub async fn reconcile(&self, token: &CancellationToken) -> Result<()> {
        let prior = PriorState::new();
        let result = self.reconcile_flow(&prior)?.run(token.clone()).await;
        result
    }

    /// Rebuild the control plane from the snapshot taken on the previous seed
    pub async fn restore(&self, token: &CancellationToken) -> Result<()> {
        let prior = match self.snapshots.load(&self.shoot.key)? {
            Some(prior) => prior,
            None => {
                warn!(shoot = %self.shoot.key, "No prior state captured, restoring from desired state only");
                PriorState::new()
            }
        };
        self.reconcile_flow(&prior)?.run(token.clone()).await?;
        self.snapshots.delete(&self.shoot.key)?;
        Ok(())
    }

    pub async fn migrate(&self, token: &CancellationToken) -> Result<()> {
        let c = &self.components;
        let mut leaving = c.extensions();
        leaving.extend(c.seed_local());

        Step::sequential(
            format!("migrate {}", self.shoot.key),
            vec![
                migrate_all(c.extensions()),
                persist_prior_state(
                    &*self.ctx.store,
                    &self.snapshots,
                    &self.shoot.key,
                    c.extension_keys(),
                ),
                destroy_all("remove control plane from source seed", leaving),
            ],
        )
        .run(token.clone())
        .await
    }

    /// Remove everything in reverse dependency order
    pub async fn delete(&self, token: &CancellationToken) -> Result<()> {
        let c = &self.components;
        let controllers: Vec<&dyn Component> = vec![
            &c.control_plane,
            &c.kube_controller_manager,
            &c.kube_scheduler,
            &c.network,
            &c.external_dns,
        ];
        let apiserver: Vec<&dyn Component> = vec![&c.kube_apiserver, &c.internal_dns];
        let etcd: Vec<&dyn Component> = vec![&c.etcd_main, &c.etcd_events];

        Step::sequential(
            format!("delete {}", self.shoot.key),
            vec![
                destroy_step(&c.worker),
                destroy_all(
                    "destroy operating system configs",
                    c.operating_system_configs
                        .iter()
                        .map(|osc| &**osc as &dyn Component)
                        .collect(),
                ),
                destroy_all("destroy controllers", controllers),
                destroy_all("destroy api server", apiserver),
                destroy_all("destroy etcd", etcd),
                destroy_all("destroy trust bundles", c.all_bundles().collect()),
                destroy_step(&c.infrastructure),
            ],
        )
        .run(token.clone())
        .await?;

        self.snapshots.delete(&self.shoot.key)?;
        info!(shoot = %self.shoot.key, "All shoot resources removed");
        Ok(())
    }

    fn reconcile_flow<'a>(&'a self, prior: &'a PriorState) -> Result<Step<'a>> {
        let c = &self.components;
        let flags = &self.flags;

        let osc_steps: Vec<Step<'a>> = c
            .operating_system_configs
            .iter()
            .map(|osc| deploy_or_restore(&**osc, flags, prior))
            .collect();

        if flags.hibernation.is_requested() {
            let pod_cidr = parse_cidr(&self.shoot.spec.networking.pods)?;
            return Ok(Step::sequential(
                format!("hibernate {}", self.shoot.key),
                vec![
                    Step::concurrent("operating system configs", osc_steps),
                    deploy_or_restore(&c.worker, flags, prior),
                    hibernation::hibernate(
                        &self.hibernation,
                        &*self.cluster,
                        pod_cidr,
                        c.deployments(),
                        c.stores(),
                    ),
                ],
            ));
        }

        let control_plane = Step::sequential(
            "control plane",
            vec![
                Step::concurrent(
                    "etcd",
                    vec![
                        scale_then_restore(&c.etcd_main, flags, prior),
                        scale_then_restore(&c.etcd_events, flags, prior),
                    ],
                ),
                deploy_or_restore(&c.kube_apiserver, flags, prior),
                Step::concurrent(
                    "dns records",
                    vec![
                        self.dns_step(&c.internal_dns, flags.needs_internal_dns, prior),
                        self.dns_step(&c.external_dns, flags.needs_external_dns, prior),
                    ],
                ),
                Step::concurrent(
                    "controllers",
                    vec![
                        deploy_or_restore(&c.control_plane, flags, prior),
                        deploy_or_restore(&c.kube_controller_manager, flags, prior),
                        deploy_or_restore(&c.kube_scheduler, flags, prior),
                        deploy_or_restore(&c.network, flags, prior),
                    ],
                ),
            ],
        );

        let mut gated = control_plane;
        for class in CredentialClass::ALL.into_iter().rev() {
            gated = rotation_gated(
                flags.rotation(class),
                c.bundles(class),
                gated,
                self.adoption_step(class),
            );
        }

        let mut steps = Vec::new();
        if self.shoot.status.hibernated {
            steps.push(hibernation::wake_up(c.stores(), c.deployments()));
        }
        steps.push(deploy_or_restore(&c.infrastructure, flags, prior));
        steps.push(gated);
        steps.push(Step::concurrent("operating system configs", osc_steps));
        steps.push(deploy_or_restore(&c.worker, flags, prior));

        Ok(Step::sequential(format!("reconcile {}", self.shoot.key), steps))
    }

    fn dns_step<'a>(&self, record: &'a Extension, needed: bool, prior: &'a PriorState) -> Step<'a> {
        if needed {
            deploy_or_restore(record, &self.flags, prior)
        } else {
            deploy_or_destroy(record, false)
        }
    }

    fn adoption_step(&self, class: CredentialClass) -> Step<'_> {
        let consumers = self.components.consumers(class);
        let poll = self.ctx.timeouts.resolve("CredentialAdoption");
        Step::new(format!("wait for {} adoption", class), move |token| async move {
            wait_until_adopted(&token, class, &consumers, &poll).await
        })
    }
}
