//! Trellis Reconciler - Per-shoot orchestration and the controller driving it
//!
//! This crate provides:
//! - Reconciliation policies choosing how each component is brought up
//! - Hibernation and wake-up sequencing
//! - Credential rotation phases and trust rollout ordering
//! - Control-plane migration between seeds
//! - [`ShootOperation`], the flows of one pass over one shoot
//! - [`ShootController`], running passes over every stored shoot

pub mod config;
pub mod controller;
pub mod hibernation;
pub mod migration;
pub mod operation;
pub mod policy;
pub mod rotation;

#[cfg(test)]
mod testing;

pub use config::{ControllerSettings, HibernationSettings, TrellisConfig};
pub use controller::{ShootController, ShootControllerConfig};
pub use hibernation::{parse_cidr, Cidr, HibernationConfig};
pub use operation::{shoot_cluster, ShootComponents, ShootOperation};
pub use policy::{deploy_or_destroy, deploy_or_restore, replicas_for, rotation_gated, scale_then_restore};
