//! Trellis Components - The lifecycle contract and the resources implementing it
//!
//! This crate provides:
//! - The [`Component`] lifecycle contract and its [`Scalable`] and
//!   [`CredentialConsumer`] extensions
//! - The readiness waiter polling operator-reported status
//! - Concrete components: extensions, DNS records, operating system configs,
//!   workers, etcd, control-plane deployments and trust bundles
//! - A recording mock for exercising orchestration without a store

pub mod component;
pub mod deployment;
pub mod dns_record;
pub mod etcd;
pub mod extension;
pub mod managed;
pub mod mock;
pub mod operating_system_config;
pub mod trust_bundle;
pub mod waiter;
pub mod worker;

pub use component::{
    deploy_and_wait, deploy_step, destroy_and_wait, destroy_step, migrate_and_wait, migrate_step,
    restore_and_wait, Component, CredentialConsumer, CredentialGenerations, Scalable,
};
pub use deployment::{ControlPlaneDeployment, DeploymentValues, CREDENTIALS_ANNOTATION_PREFIX};
pub use dns_record::{dns_record, DnsRecordPurpose};
pub use etcd::{Etcd, EtcdValues};
pub use extension::Extension;
pub use managed::{ComponentContext, ManagedObject};
pub use mock::{Call, CallLog, CallRecord, MockComponent};
pub use operating_system_config::{CloudConfigRef, OperatingSystemConfig};
pub use trust_bundle::TrustBundle;
pub use waiter::ReadinessWaiter;
pub use worker::Worker;
