//! Bounded status polling.

use std::time::Duration;

use tracing::{debug, error};

use crate::clock::Clock;
use crate::domain::status::MachineStatus;
use crate::errors::{DriverError, Result};

/// Polls a machine's fabric status until it matches an expected value.
pub struct StatusPoller<'a> {
    clock: &'a dyn Clock,
    machine_uuid: &'a str,
}

impl<'a> StatusPoller<'a> {
    pub fn new(clock: &'a dyn Clock, machine_uuid: &'a str) -> Self {
        Self {
            clock,
            machine_uuid,
        }
    }

    /// Query until `expected` is seen.
    ///
    /// A failed query and an ERROR status both end the wait at once. The
    /// deadline is only checked after a mismatch, so at least one query
    /// always runs no matter how small `timeout` is.
    pub fn wait_for<F>(
        &self,
        expected: MachineStatus,
        step: Duration,
        timeout: Duration,
        mut query: F,
    ) -> Result<()>
    where
        F: FnMut() -> Result<MachineStatus>,
    {
        let start = self.clock.now();

        loop {
            let current = query().map_err(|e| {
                error!(machine_uuid = %self.machine_uuid, error = %e, "error while checking state");
                DriverError::StatusQuery {
                    machine_uuid: self.machine_uuid.to_string(),
                    source: Box::new(e),
                }
            })?;

            if current == MachineStatus::Error {
                error!(machine_uuid = %self.machine_uuid, expected = %expected, "received ERROR state");
                return Err(DriverError::ErrorState {
                    machine_uuid: self.machine_uuid.to_string(),
                    expected,
                });
            }

            if current == expected {
                debug!(machine_uuid = %self.machine_uuid, status = %current, "required status reached");
                return Ok(());
            }

            if self.clock.elapsed_since(start) >= timeout {
                error!(
                    machine_uuid = %self.machine_uuid,
                    expected = %expected,
                    current = %current,
                    timeout_secs = timeout.as_secs(),
                    "required status was not achieved within the specified time"
                );
                return Err(DriverError::Timeout {
                    machine_uuid: self.machine_uuid.to_string(),
                    expected,
                    current,
                    timeout,
                });
            }

            debug!(expected = %expected, current = %current, "status mismatch, polling again");
            self.clock.sleep(step);
        }
    }
}
