// ── Capability preflight ──
//
// The service refuses to start unless every required capability is
// granted. The host platform answers through `PermissionChecker`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A platform capability the peripheral needs before it may advertise.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    AccessBackgroundLocation,
    BluetoothAdvertise,
    BluetoothConnect,
}

/// Everything `start()` checks, in report order.
pub const REQUIRED_CAPABILITIES: [Capability; 3] = [
    Capability::AccessBackgroundLocation,
    Capability::BluetoothAdvertise,
    Capability::BluetoothConnect,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Answers whether a capability is currently granted.
pub trait PermissionChecker {
    fn check_permission(&self, capability: Capability) -> PermissionStatus;
}

impl<F> PermissionChecker for F
where
    F: Fn(Capability) -> PermissionStatus,
{
    fn check_permission(&self, capability: Capability) -> PermissionStatus {
        self(capability)
    }
}

/// A fixed grant table. Everything not explicitly denied is granted.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    denied: HashSet<Capability>,
}

impl StaticPermissions {
    pub fn all_granted() -> Self {
        Self::default()
    }

    pub fn deny(mut self, capability: Capability) -> Self {
        self.denied.insert(capability);
        self
    }
}

impl FromIterator<Capability> for StaticPermissions {
    /// Collects the *denied* capabilities.
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            denied: iter.into_iter().collect(),
        }
    }
}

impl PermissionChecker for StaticPermissions {
    fn check_permission(&self, capability: Capability) -> PermissionStatus {
        if self.denied.contains(&capability) {
            PermissionStatus::Denied
        } else {
            PermissionStatus::Granted
        }
    }
}

/// The subset of `required` that `checker` does not grant, in order.
pub fn missing_capabilities<P>(checker: &P, required: &[Capability]) -> Vec<Capability>
where
    P: PermissionChecker + ?Sized,
{
    required
        .iter()
        .copied()
        .filter(|c| checker.check_permission(*c) == PermissionStatus::Denied)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn all_granted_reports_nothing_missing() {
        let checker = StaticPermissions::all_granted();
        assert!(missing_capabilities(&checker, &REQUIRED_CAPABILITIES).is_empty());
    }

    #[test]
    fn missing_preserves_required_order() {
        let checker = StaticPermissions::all_granted()
            .deny(Capability::BluetoothConnect)
            .deny(Capability::AccessBackgroundLocation);
        assert_eq!(
            missing_capabilities(&checker, &REQUIRED_CAPABILITIES),
            vec![
                Capability::AccessBackgroundLocation,
                Capability::BluetoothConnect
            ]
        );
    }

    #[test]
    fn closures_are_checkers() {
        let checker = |c: Capability| {
            if c == Capability::BluetoothAdvertise {
                PermissionStatus::Denied
            } else {
                PermissionStatus::Granted
            }
        };
        assert_eq!(
            missing_capabilities(&checker, &REQUIRED_CAPABILITIES),
            vec![Capability::BluetoothAdvertise]
        );
    }

    #[test]
    fn capability_names_are_kebab_case() {
        assert_eq!(Capability::BluetoothAdvertise.to_string(), "bluetooth-advertise");
        assert_eq!(
            Capability::from_str("access-background-location").unwrap(),
            Capability::AccessBackgroundLocation
        );
    }
}
