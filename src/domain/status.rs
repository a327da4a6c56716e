//! Fabric machine status codes and the coarse lifecycle states reported to
//! the hosting process.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Status code the fabric manager reports for a machine (`mach_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineStatus {
    BuildingBeforeQueue,
    Building,
    Booting,
    ActivePowerOn,
    PoweringOff,
    ActivePowerOff,
    Unbuilding,
    Unbuilded,
    OsInstalling,
    Erasing,
    AddingResource,
    DeletingResource,
    UnbuildingWait,
    Error,
    Other(i64),
}

const CODES: &[(i64, MachineStatus)] = &[
    (10, MachineStatus::BuildingBeforeQueue),
    (11, MachineStatus::Building),
    (12, MachineStatus::Booting),
    (13, MachineStatus::ActivePowerOn),
    (14, MachineStatus::PoweringOff),
    (15, MachineStatus::ActivePowerOff),
    (16, MachineStatus::Unbuilding),
    (17, MachineStatus::Unbuilded),
    (18, MachineStatus::OsInstalling),
    (19, MachineStatus::Erasing),
    (20, MachineStatus::AddingResource),
    (21, MachineStatus::DeletingResource),
    (30, MachineStatus::UnbuildingWait),
    (90, MachineStatus::Error),
];

impl MachineStatus {
    pub fn from_code(code: i64) -> Self {
        CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, status)| *status)
            .unwrap_or(MachineStatus::Other(code))
    }

    pub fn code(self) -> i64 {
        match self {
            MachineStatus::Other(code) => code,
            known => CODES
                .iter()
                .find(|(_, status)| *status == known)
                .map(|(code, _)| *code)
                .unwrap_or_default(),
        }
    }

    /// Collapse the fabric status onto the lifecycle state exposed to the host.
    pub fn lifecycle(self) -> LifecycleState {
        match self {
            MachineStatus::BuildingBeforeQueue | MachineStatus::Building | MachineStatus::Booting => {
                LifecycleState::Starting
            }
            MachineStatus::ActivePowerOn => LifecycleState::Running,
            MachineStatus::PoweringOff => LifecycleState::Stopping,
            MachineStatus::ActivePowerOff
            | MachineStatus::Unbuilded
            | MachineStatus::Unbuilding
            | MachineStatus::UnbuildingWait => LifecycleState::Stopped,
            MachineStatus::OsInstalling => LifecycleState::Paused,
            MachineStatus::Error => LifecycleState::Error,
            MachineStatus::Erasing
            | MachineStatus::AddingResource
            | MachineStatus::DeletingResource
            | MachineStatus::Other(_) => {
                warn!(machine_status = %self, code = self.code(), "unrecognized machine status");
                LifecycleState::Unknown
            }
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineStatus::BuildingBeforeQueue => "BUILDING_BEFORE_QUEUE",
            MachineStatus::Building => "BUILDING",
            MachineStatus::Booting => "BOOTING",
            MachineStatus::ActivePowerOn => "ACTIVE_PON",
            MachineStatus::PoweringOff => "POWERING_OFF",
            MachineStatus::ActivePowerOff => "ACTIVE_POFF",
            MachineStatus::Unbuilding => "UNBUILDING",
            MachineStatus::Unbuilded => "UNBUILDED",
            MachineStatus::OsInstalling => "OS_INSTALLING",
            MachineStatus::Erasing => "ERASING",
            MachineStatus::AddingResource => "ADDING_RESOURCE",
            MachineStatus::DeletingResource => "DELETING_RESOURCE",
            MachineStatus::UnbuildingWait => "UNBUILDING_WAIT",
            MachineStatus::Error => "ERROR",
            MachineStatus::Other(code) => return write!(f, "UNKNOWN({code})"),
        };
        f.write_str(name)
    }
}

/// Generic machine state understood by the hosting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Paused,
    Error,
    Unknown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Starting => "Starting",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Paused => "Paused",
            LifecycleState::Error => "Error",
            LifecycleState::Unknown => "",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_lifecycle_groups() {
        let expected = [
            (10, LifecycleState::Starting),
            (11, LifecycleState::Starting),
            (12, LifecycleState::Starting),
            (13, LifecycleState::Running),
            (14, LifecycleState::Stopping),
            (15, LifecycleState::Stopped),
            (16, LifecycleState::Stopped),
            (17, LifecycleState::Stopped),
            (18, LifecycleState::Paused),
            (30, LifecycleState::Stopped),
            (90, LifecycleState::Error),
        ];
        for (code, state) in expected {
            let status = MachineStatus::from_code(code);
            assert_eq!(status.lifecycle(), state, "code {code}");
            // same input, same answer
            assert_eq!(status.lifecycle(), state, "code {code}");
        }
    }

    #[test]
    fn unmapped_codes_are_unknown() {
        for code in [0, 1, 19, 20, 21, 42, 99, -1, i64::MAX] {
            assert_eq!(
                MachineStatus::from_code(code).lifecycle(),
                LifecycleState::Unknown,
                "code {code}"
            );
        }
    }

    #[test]
    fn unknown_code_keeps_its_value() {
        let status = MachineStatus::from_code(42);
        assert_eq!(status, MachineStatus::Other(42));
        assert_eq!(status.code(), 42);
        assert_eq!(status.to_string(), "UNKNOWN(42)");
        assert_eq!(MachineStatus::from_code(17).code(), 17);
    }
}
