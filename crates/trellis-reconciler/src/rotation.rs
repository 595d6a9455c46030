//! Credential rotation phases
//!
//! Each credential class rotates on its own. A rotation moves a class from
//! generation `g` to `g + 1`:
//!
//! | phase      | trusted        | signing |
//! |------------|----------------|---------|
//! | None       | `[g]`          | `g`     |
//! | Preparing  | `[g, g + 1]`   | `g`     |
//! | Prepared   | `[g, g + 1]`   | `g + 1` |
//! | Completing | `[g + 1]`      | `g + 1` |
//! | Completed  | `[g]`          | `g`     |
//!
//! When `Completing` finishes, the stored generation becomes `g + 1`, so
//! `Completed` trusts and signs with what used to be the new material.

use tracing::info;
use trellis_components::CredentialConsumer;
use trellis_core::{CredentialClass, RotationPhase, RotationRequest, TrellisError};
use trellis_flow::{poll, CancellationToken, PollConfig, Result, TaskOutcome};

/// Generations consumers must accept in `phase`
pub fn trust_bundle(phase: RotationPhase, generation: u32) -> Vec<u32> {
    match phase {
        RotationPhase::None | RotationPhase::Completed => vec![generation],
        RotationPhase::Preparing | RotationPhase::Prepared => vec![generation, generation + 1],
        RotationPhase::Completing => vec![generation + 1],
    }
}

/// Generation credentials are issued from in `phase`
pub fn signing_generation(phase: RotationPhase, generation: u32) -> u32 {
    match phase {
        RotationPhase::None | RotationPhase::Preparing | RotationPhase::Completed => generation,
        RotationPhase::Prepared | RotationPhase::Completing => generation + 1,
    }
}

/// Phase a pass runs in, after consuming the user's request
///
/// Starting while a rotation is already in flight is a no-op; completing is
/// only possible once the class is prepared.
pub fn begin_pass(
    class: CredentialClass,
    phase: RotationPhase,
    request: Option<RotationRequest>,
) -> std::result::Result<RotationPhase, TrellisError> {
    let next = match (phase, request) {
        (_, None) => phase,
        (RotationPhase::None | RotationPhase::Completed, Some(RotationRequest::Start)) => {
            RotationPhase::Preparing
        }
        (_, Some(RotationRequest::Start)) => phase,
        (RotationPhase::Prepared, Some(RotationRequest::Complete)) => RotationPhase::Completing,
        (RotationPhase::Completing, Some(RotationRequest::Complete)) => phase,
        (_, Some(RotationRequest::Complete)) => {
            return Err(TrellisError::invalid_rotation_transition(
                class.as_str(),
                phase.to_string(),
                RotationPhase::Completing.to_string(),
            ))
        }
    };

    if next != phase {
        info!(credential = %class, from = %phase, to = %next, "Credential rotation advanced");
    }
    Ok(next)
}

/// Phase and generation after a pass in `phase` succeeded
pub fn finish_pass(phase: RotationPhase, generation: u32) -> (RotationPhase, u32) {
    match phase {
        RotationPhase::Preparing => (RotationPhase::Prepared, generation),
        RotationPhase::Completing => (RotationPhase::Completed, generation + 1),
        _ => (phase, generation),
    }
}

/// Wait until every consumer runs with the credentials it was last deployed with
pub async fn wait_until_adopted(
    token: &CancellationToken,
    class: CredentialClass,
    consumers: &[&dyn CredentialConsumer],
    config: &PollConfig,
) -> Result<()> {
    let operation = format!("wait for {} adoption", class);
    poll(token, &operation, config, |_| async move {
        let mut pending = Vec::new();
        for consumer in consumers {
            match consumer.credentials_adopted(class).await {
                Ok(true) => {}
                Ok(false) => pending.push(consumer.name().to_string()),
                Err(e) => {
                    return TaskOutcome::retry(format!("reading {}: {}", consumer.name(), e))
                }
            }
        }
        if pending.is_empty() {
            TaskOutcome::Done(())
        } else {
            TaskOutcome::retry(format!("{} not yet using new {}", pending.join(", "), class))
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use trellis_components::{CallLog, MockComponent};

    const CA: CredentialClass = CredentialClass::CertificateAuthorities;

    #[test]
    fn test_trust_and_signing_through_a_rotation() {
        let mut phase = RotationPhase::None;
        let mut generation = 1;
        assert_eq!(trust_bundle(phase, generation), vec![1]);

        phase = begin_pass(CA, phase, Some(RotationRequest::Start)).unwrap();
        assert_eq!(phase, RotationPhase::Preparing);
        assert_eq!(trust_bundle(phase, generation), vec![1, 2]);
        assert_eq!(signing_generation(phase, generation), 1);

        (phase, generation) = finish_pass(phase, generation);
        assert_eq!(phase, RotationPhase::Prepared);
        assert_eq!(trust_bundle(phase, generation), vec![1, 2]);
        assert_eq!(signing_generation(phase, generation), 2);

        phase = begin_pass(CA, phase, Some(RotationRequest::Complete)).unwrap();
        assert_eq!(phase, RotationPhase::Completing);
        assert_eq!(trust_bundle(phase, generation), vec![2]);
        assert_eq!(signing_generation(phase, generation), 2);

        (phase, generation) = finish_pass(phase, generation);
        assert_eq!((phase, generation), (RotationPhase::Completed, 2));
        assert_eq!(trust_bundle(phase, generation), vec![2]);
        assert_eq!(signing_generation(phase, generation), 2);
    }

    #[test]
    fn test_requests_out_of_order() {
        let err = begin_pass(CA, RotationPhase::None, Some(RotationRequest::Complete)).unwrap_err();
        assert!(matches!(err, TrellisError::InvalidRotationTransition { .. }));
        assert!(begin_pass(CA, RotationPhase::Preparing, Some(RotationRequest::Complete)).is_err());

        assert_eq!(
            begin_pass(CA, RotationPhase::Prepared, Some(RotationRequest::Start)).unwrap(),
            RotationPhase::Prepared
        );
        assert_eq!(
            begin_pass(CA, RotationPhase::Completed, Some(RotationRequest::Start)).unwrap(),
            RotationPhase::Preparing
        );
        assert_eq!(
            finish_pass(RotationPhase::None, 4),
            (RotationPhase::None, 4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_adopted() {
        let log = CallLog::new();
        let apiserver = Arc::new(MockComponent::new("kube-apiserver", log.clone()));
        let etcd = MockComponent::new("etcd-main", log);
        apiserver.set_adopted(CA, false);

        let rolled = apiserver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            rolled.set_adopted(CA, true);
        });

        let start = tokio::time::Instant::now();
        let consumers: [&dyn CredentialConsumer; 2] = [&*apiserver, &etcd];
        wait_until_adopted(&CancellationToken::new(), CA, &consumers, &PollConfig::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adoption_times_out() {
        let etcd = MockComponent::new("etcd-main", CallLog::new());
        etcd.set_adopted(CA, false);

        let consumers: [&dyn CredentialConsumer; 1] = [&etcd];
        let err = wait_until_adopted(&CancellationToken::new(), CA, &consumers, &PollConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("etcd-main"));
    }
}
