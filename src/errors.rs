//! Error taxonomy for the node driver.
//!
//! Configuration problems are reported before any remote call. Remote,
//! timeout and rollback failures carry the machine UUID so an operator can
//! act on them without re-running with debug logging.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::domain::status::MachineStatus;

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// The public lifecycle operations exposed to the hosting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    PreCreateCheck,
    Create,
    Start,
    Stop,
    Kill,
    Restart,
    Remove,
    GetState,
    GetIp,
    GetUrl,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::PreCreateCheck => "pre-create check",
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Kill => "kill",
            Operation::Restart => "restart",
            Operation::Remove => "remove",
            Operation::GetState => "get state",
            Operation::GetIp => "get ip",
            Operation::GetUrl => "get url",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0}")]
    Config(String),

    #[error("machine uuid is empty; {operation} needs a created machine")]
    MissingMachineUuid { operation: Operation },

    #[error("IP address is empty")]
    MissingIpAddress,

    #[error("{method} {endpoint} failed{}: {message}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Fabric {
        method: &'static str,
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("identity service: {0}")]
    Identity(String),

    #[error("{0}")]
    Authorization(String),

    #[error("ssh to {host}: {message}")]
    Ssh { host: String, message: String },

    #[error("cloud-init config: {0}")]
    CloudConfig(String),

    #[error("querying status of machine {machine_uuid}: {source}")]
    StatusQuery {
        machine_uuid: String,
        #[source]
        source: Box<DriverError>,
    },

    #[error("machine {machine_uuid} reported ERROR state while waiting for {expected}")]
    ErrorState {
        machine_uuid: String,
        expected: MachineStatus,
    },

    #[error(
        "machine {machine_uuid} did not reach {expected} within {timeout:?} (last status {current})"
    )]
    Timeout {
        machine_uuid: String,
        expected: MachineStatus,
        current: MachineStatus,
        timeout: Duration,
    },

    #[error("no lanport found on provisioning subnet {subnet_uuid}; IP address must not be empty")]
    MissingProvisioningAddress { subnet_uuid: String },

    #[error("boot storage not found among resources of machine {machine_uuid}")]
    BootStorageNotFound { machine_uuid: String },

    #[error("{source}; partially created machine {machine_uuid} was removed")]
    CreateRolledBack {
        machine_uuid: String,
        #[source]
        source: Box<DriverError>,
    },

    #[error("error during create: '{create}'; followed by error during remove: '{remove}'")]
    RollbackFailed {
        create: Box<DriverError>,
        remove: Box<DriverError>,
    },

    #[error(
        "{operation} failed for machine {}: {source}",
        machine_uuid.as_deref().unwrap_or("<no uuid>")
    )]
    Lifecycle {
        operation: Operation,
        machine_uuid: Option<String>,
        #[source]
        source: Box<DriverError>,
    },
}

impl DriverError {
    pub fn config(message: impl Into<String>) -> Self {
        DriverError::Config(message.into())
    }

    /// Error for a mandatory option that was left empty.
    pub fn mandatory(what: &str, key: &str) -> Self {
        DriverError::Config(format!("{what} must be specified using the config key {key}"))
    }

    pub fn ssh(host: &str, message: impl Into<String>) -> Self {
        DriverError::Ssh {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn during(self, operation: Operation, machine_uuid: Option<&str>) -> Self {
        DriverError::Lifecycle {
            operation,
            machine_uuid: machine_uuid.map(str::to_string),
            source: Box::new(self),
        }
    }

    /// Peel lifecycle, status-query and rollback wrappers down to the
    /// failure that started the chain.
    pub fn root_cause(&self) -> &DriverError {
        match self {
            DriverError::Lifecycle { source, .. }
            | DriverError::StatusQuery { source, .. }
            | DriverError::CreateRolledBack { source, .. } => source.root_cause(),
            DriverError::RollbackFailed { create, .. } => create.root_cause(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), DriverError::Timeout { .. })
    }
}
