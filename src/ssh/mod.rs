//! Remote bootstrap of a freshly installed node over SSH.

pub mod executor;
pub mod shell;

use std::time::Duration;

use crate::config::Timeouts;
use crate::errors::Result;

pub use executor::StandardSshExecutor;
use shell::ConnectRetry;

/// What a session is opened for. Decides the credentials and how long to
/// wait for the host to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Freshly installed node: password auth, full reachability wait.
    Bootstrap,
    /// Cleanup on a node that may be powered off: the exchanged key when
    /// present, and a single dial.
    BestEffort,
}

impl SessionKind {
    pub fn use_key(self) -> bool {
        self == SessionKind::BestEffort
    }

    pub fn connect_retry(self, timeouts: &Timeouts) -> ConnectRetry {
        match self {
            SessionKind::Bootstrap => ConnectRetry {
                attempts: timeouts.ssh_connect_attempts,
                delay: timeouts.ssh_connect_delay(),
            },
            SessionKind::BestEffort => ConnectRetry {
                attempts: 1,
                delay: Duration::ZERO,
            },
        }
    }
}

/// Remote operations the driver performs on a node once it has an address.
pub trait SshExecutor {
    /// Generate a local key pair and authorize it on the node. Later
    /// commands authenticate with the key.
    fn exchange_keys(&mut self) -> Result<()>;

    /// Write `body` to `path` (or a random scratch path), run it and clean up.
    fn execute_script(
        &mut self,
        path: Option<&str>,
        body: &str,
        remove_after: bool,
        use_sudo: bool,
    ) -> Result<()>;

    fn write_remote_file(&mut self, path: &str, content: &[u8], mode: u32) -> Result<()>;

    /// `cloud-init clean --logs --reboot`. The dropped session counts as success.
    fn reboot_cloud_init(&mut self) -> Result<()>;

    /// No-op when `code` is empty.
    fn register_os(&mut self, code: &str, email: &str) -> Result<()>;

    fn deregister_os(&mut self) -> Result<()>;

    fn disable_password_login(&mut self) -> Result<()>;
}
