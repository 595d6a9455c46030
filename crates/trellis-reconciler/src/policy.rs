//! Decision functions choosing which lifecycle calls a pass makes, and in
//! which order.
//!
//! Policies build [`Step`]s and never retry on their own; waiting and
//! retrying is left to the poller behind each component's `wait*` methods.

use tracing::info;
use trellis_components::{deploy_step, destroy_step, restore_and_wait, Component, Scalable};
use trellis_core::{HibernationState, PhaseFlags, RotationPhase};
use trellis_flow::Step;
use trellis_storage::PriorState;

/// Deploy and wait when the resource is needed, otherwise destroy it and
/// wait for the cleanup
pub fn deploy_or_destroy<'a>(component: &'a dyn Component, needed: bool) -> Step<'a> {
    if needed {
        deploy_step(component)
    } else {
        destroy_step(component)
    }
}

/// Restore from the captured state while restoring, deploy otherwise
pub fn deploy_or_restore<'a>(
    component: &'a dyn Component,
    flags: &PhaseFlags,
    prior: &'a PriorState,
) -> Step<'a> {
    if flags.is_restoring() {
        Step::new(format!("restore {}", component.name()), move |token| async move {
            restore_and_wait(component, &token, prior).await
        })
    } else {
        deploy_step(component)
    }
}

/// Deploy a replicated store cluster, bringing it up as a single member
/// first when it is being restored
///
/// A restoring cluster that runs fewer replicas than desired is restored from
/// the captured state with one replica and waited for, then scaled to the
/// desired count and waited for again. Otherwise this behaves like
/// [`deploy_or_restore`].
pub fn scale_then_restore<'a, C>(component: &'a C, flags: &PhaseFlags, prior: &'a PriorState) -> Step<'a>
where
    C: Scalable + ?Sized,
{
    let restoring = flags.is_restoring();
    let verb = if restoring { "restore" } else { "deploy" };

    Step::new(format!("{} {}", verb, component.name()), move |token| async move {
        let desired = component.desired_replicas();
        if restoring && desired > 1 {
            let current = component.current_replicas().await?.unwrap_or(0);
            if current < desired {
                info!(
                    component = %component.name(),
                    current,
                    desired,
                    "Restoring with a single replica before scaling up"
                );
                component.restore_with_replicas(&token, 1, prior).await?;
                component.wait(&token).await?;
                component.scale(&token, desired).await?;
                return component.wait(&token).await;
            }
        }

        if restoring {
            component.restore(&token, prior).await?;
        } else {
            component.deploy(&token).await?;
        }
        component.wait(&token).await
    })
}

/// Replica count a workload is deployed with in the given hibernation state
///
/// A shoot on its way into hibernation keeps its replicas; scaling down is
/// left to the hibernation sequence once its preconditions hold.
pub fn replicas_for(hibernation: HibernationState, desired: i32) -> i32 {
    match hibernation {
        HibernationState::Hibernated => 0,
        HibernationState::Awake | HibernationState::Hibernating => desired,
    }
}

/// Order trust material rollout around its consumers
///
/// Outside of `Completing`, all trust bundles are rolled out concurrently and
/// waited for before `consumers` runs, so new material is trusted everywhere
/// before anything authenticates with it. In `Completing` the old material is
/// dropped from the bundles only after `consumers` ran and `adoption`
/// confirmed every consumer uses the new material.
pub fn rotation_gated<'a>(
    phase: RotationPhase,
    bundles: Vec<&'a dyn Component>,
    consumers: Step<'a>,
    adoption: Step<'a>,
) -> Step<'a> {
    let rollout = Step::concurrent(
        "roll out trust bundles",
        bundles.into_iter().map(deploy_step).collect(),
    );

    match phase {
        RotationPhase::Completing => Step::sequential(
            "complete credential rotation",
            vec![consumers, adoption, rollout],
        ),
        _ => Step::sequential("distribute trust before use", vec![rollout, consumers]),
    }
}
