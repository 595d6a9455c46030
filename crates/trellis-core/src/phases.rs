use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Whether a pass converges from fresh desired state or from a prior-state snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReconciliationPhase {
    #[default]
    Normal,
    /// The control plane is being rebuilt on a new seed after migration
    Restoring,
}

impl fmt::Display for ReconciliationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationPhase::Normal => write!(f, "Normal"),
            ReconciliationPhase::Restoring => write!(f, "Restoring"),
        }
    }
}

/// Hibernation state of a shoot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HibernationState {
    #[default]
    Awake,
    /// Hibernation was requested but the control plane still runs
    Hibernating,
    /// Control plane and workers are scaled to zero
    Hibernated,
}

impl HibernationState {
    /// Derive the state from the requested flag and the last observed outcome
    pub fn from_flags(requested: bool, hibernated: bool) -> Self {
        match (requested, hibernated) {
            (false, _) => HibernationState::Awake,
            (true, false) => HibernationState::Hibernating,
            (true, true) => HibernationState::Hibernated,
        }
    }

    /// Whether workers and workloads should be driven towards zero
    pub fn is_requested(&self) -> bool {
        !matches!(self, HibernationState::Awake)
    }
}

impl fmt::Display for HibernationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HibernationState::Awake => write!(f, "Awake"),
            HibernationState::Hibernating => write!(f, "Hibernating"),
            HibernationState::Hibernated => write!(f, "Hibernated"),
        }
    }
}

/// Credential classes that rotate independently of each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialClass {
    CertificateAuthorities,
    ServiceAccountKey,
    EtcdEncryptionKey,
}

impl CredentialClass {
    pub const ALL: [CredentialClass; 3] = [
        CredentialClass::CertificateAuthorities,
        CredentialClass::ServiceAccountKey,
        CredentialClass::EtcdEncryptionKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialClass::CertificateAuthorities => "certificate-authorities",
            CredentialClass::ServiceAccountKey => "service-account-key",
            CredentialClass::EtcdEncryptionKey => "etcd-encryption-key",
        }
    }
}

impl fmt::Display for CredentialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase of a credential rotation
///
/// While `Preparing` and `Prepared` both the old and the new material are
/// trusted. `Completing` drops the old material once every consumer has
/// adopted the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RotationPhase {
    #[default]
    None,
    Preparing,
    Prepared,
    Completing,
    Completed,
}

impl RotationPhase {
    /// Whether old and new material are both valid in this phase
    pub fn trusts_both(&self) -> bool {
        matches!(self, RotationPhase::Preparing | RotationPhase::Prepared)
    }

    /// Whether a rotation is currently in flight
    pub fn in_progress(&self) -> bool {
        !matches!(self, RotationPhase::None | RotationPhase::Completed)
    }
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationPhase::None => "None",
            RotationPhase::Preparing => "Preparing",
            RotationPhase::Prepared => "Prepared",
            RotationPhase::Completing => "Completing",
            RotationPhase::Completed => "Completed",
        };
        write!(f, "{}", s)
    }
}

/// Process-wide flags read by the reconciliation policies of one pass
///
/// Computed once per pass from the parent shoot and passed explicitly into
/// every policy function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseFlags {
    pub reconciliation: ReconciliationPhase,
    pub hibernation: HibernationState,
    pub rotation: BTreeMap<CredentialClass, RotationPhase>,
    pub needs_internal_dns: bool,
    pub needs_external_dns: bool,
}

impl PhaseFlags {
    /// Rotation phase of one credential class (None when never rotated)
    pub fn rotation(&self, class: CredentialClass) -> RotationPhase {
        self.rotation.get(&class).copied().unwrap_or_default()
    }

    pub fn is_restoring(&self) -> bool {
        self.reconciliation == ReconciliationPhase::Restoring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hibernation_from_flags() {
        assert_eq!(HibernationState::from_flags(false, false), HibernationState::Awake);
        // Wake-up: spec no longer requests hibernation while status still says hibernated
        assert_eq!(HibernationState::from_flags(false, true), HibernationState::Awake);
        assert_eq!(
            HibernationState::from_flags(true, false),
            HibernationState::Hibernating
        );
        assert_eq!(
            HibernationState::from_flags(true, true),
            HibernationState::Hibernated
        );
    }

    #[test]
    fn test_rotation_trust_windows() {
        assert!(RotationPhase::Preparing.trusts_both());
        assert!(RotationPhase::Prepared.trusts_both());
        assert!(!RotationPhase::Completing.trusts_both());
        assert!(!RotationPhase::None.in_progress());
        assert!(RotationPhase::Completing.in_progress());
    }

    #[test]
    fn test_phase_flags_default_rotation() {
        let mut flags = PhaseFlags::default();
        assert_eq!(
            flags.rotation(CredentialClass::CertificateAuthorities),
            RotationPhase::None
        );
        flags
            .rotation
            .insert(CredentialClass::ServiceAccountKey, RotationPhase::Prepared);
        assert_eq!(
            flags.rotation(CredentialClass::ServiceAccountKey),
            RotationPhase::Prepared
        );
    }
}
