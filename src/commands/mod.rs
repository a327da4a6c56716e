//! One module per lifecycle subcommand, sharing a [`Session`].

pub mod check;
pub mod create;
pub mod power;
pub mod query;
pub mod remove;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::clock::SystemClock;
use crate::config::DriverConfig;
use crate::domain::driver::{Driver, StandardClients};
use crate::domain::node::Node;
use crate::errors::DriverError;
use crate::store::NodeStore;

/// Loaded configuration plus the persisted record of the node being acted on.
pub struct Session {
    config: DriverConfig,
    store: NodeStore,
    node: Node,
}

impl Session {
    pub fn open(
        config: DriverConfig,
        machine_name: &str,
        store_path: Option<PathBuf>,
    ) -> Result<Self> {
        let store_path = match store_path {
            Some(path) => path,
            None => DriverConfig::default_store_path()?,
        };
        let store = NodeStore::new(store_path);

        let node = match store.load(machine_name)? {
            Some(node) => node,
            None => {
                let key_path = config
                    .ssh
                    .key_path
                    .clone()
                    .unwrap_or_else(|| store.ssh_key_path(machine_name));
                Node::new(machine_name, key_path)
            }
        };
        debug!(
            machine_name,
            machine_uuid = %node.machine_uuid,
            store = %store.root().display(),
            "node record loaded"
        );

        Ok(Self {
            config,
            store,
            node,
        })
    }

    /// Run one driver operation. The record is written back whenever it
    /// changed, failed operations included, so an acquired UUID is kept.
    pub fn run<T>(
        &mut self,
        operation: impl FnOnce(&mut Driver<'_>) -> Result<T, DriverError>,
    ) -> Result<T> {
        let clock = SystemClock;
        let clients = StandardClients;
        let mut driver = Driver::new(&self.config, &clock, &clients, self.node.clone());

        let result = operation(&mut driver);

        let node = driver.into_node();
        let saved = if node != self.node {
            let saved = self
                .store
                .save(&node)
                .with_context(|| format!("saving node record for {}", node.machine_name));
            self.node = node;
            saved
        } else {
            Ok(())
        };

        if let Err(e) = &result {
            if e.is_timeout() {
                warn!(
                    machine_name = %self.node.machine_name,
                    "status not reached in time; the fabric may still complete the transition"
                );
            }
        }
        settle(result, saved)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Forget the node entirely, keys included.
    pub fn forget(&self) -> Result<()> {
        self.store.delete(&self.node.machine_name)
    }
}

/// The operation's own error wins over a failed record write, which is
/// attached to it rather than replacing it.
fn settle<T>(result: Result<T, DriverError>, saved: Result<()>) -> Result<T> {
    match (result, saved) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(save_err)) => Err(save_err),
        (Err(e), Ok(())) => Err(anyhow::Error::new(e)),
        (Err(e), Err(save_err)) => {
            Err(anyhow::Error::new(e).context(format!("node record not saved: {save_err:#}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_survives_failed_save() {
        let err = settle::<()>(
            Err(DriverError::MissingIpAddress),
            Err(anyhow::anyhow!("disk full")),
        )
        .unwrap_err();

        let rendered = format!("{err:#}");
        assert!(rendered.contains("disk full"));
        assert!(rendered.contains(&DriverError::MissingIpAddress.to_string()));
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::MissingIpAddress)
        ));
    }

    #[test]
    fn failed_save_is_reported_after_success() {
        let err = settle(Ok(7), Err(anyhow::anyhow!("disk full"))).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(settle(Ok(7), Ok(())).unwrap(), 7);
    }
}
