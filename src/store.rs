//! NodeStore: atomic JSON persistence of node records with SHA-256 integrity.
//!
//! Layout: `<root>/machines/<name>/node.json`, next to the node's SSH keys.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::node::Node;

const RECORD_FILE: &str = "node.json";

/// On-disk envelope around a node record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNode {
    /// "sha256:<hex>" over the serialized node
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    /// Host the driver ran on when the record was written.
    pub saved_on: String,
    pub driver_version: String,
    pub node: Node,
}

impl StoredNode {
    pub fn new(node: Node) -> Self {
        Self {
            checksum: checksum(&node),
            saved_at: Utc::now(),
            saved_on: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            node,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == checksum(&self.node)
    }
}

fn checksum(node: &Node) -> String {
    let serialized = serde_json::to_string(node).unwrap_or_default();
    format!("sha256:{:x}", Sha256::digest(serialized.as_bytes()))
}

pub struct NodeStore {
    root: PathBuf,
}

impl NodeStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn machine_dir(&self, machine_name: &str) -> PathBuf {
        self.root.join("machines").join(machine_name)
    }

    fn record_path(&self, machine_name: &str) -> PathBuf {
        self.machine_dir(machine_name).join(RECORD_FILE)
    }

    /// Default private key location for a node.
    pub fn ssh_key_path(&self, machine_name: &str) -> PathBuf {
        self.machine_dir(machine_name).join("id_rsa")
    }

    /// Load the record for `machine_name`, or `None` if it was never saved.
    pub fn load(&self, machine_name: &str) -> Result<Option<Node>> {
        let path = self.record_path(machine_name);
        if !path.exists() {
            debug!(path = %path.display(), "no node record yet");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let stored: StoredNode = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;

        if !stored.verify() {
            warn!(path = %path.display(), "node record checksum mismatch");
            bail!("checksum verification failed for {}", path.display());
        }
        Ok(Some(stored.node))
    }

    /// Write to a `.tmp` file, then rename over the record so it is always complete.
    pub fn save(&self, node: &Node) -> Result<()> {
        let path = self.record_path(&node.machine_name);
        let content = serde_json::to_string_pretty(&StoredNode::new(node.clone()))
            .context("failed to serialize node record")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;

        debug!(path = %path.display(), machine_uuid = %node.machine_uuid, "node record saved");
        Ok(())
    }

    /// Drop the node's directory, keys included.
    pub fn delete(&self, machine_name: &str) -> Result<()> {
        let dir = self.machine_dir(machine_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(store: &NodeStore) -> Node {
        let mut node = Node::new("node-1", store.ssh_key_path("node-1"));
        node.machine_uuid = "m-1".into();
        node.ip_address = "10.0.0.5".into();
        node
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().to_path_buf());
        let saved = node(&store);

        store.save(&saved).unwrap();
        assert_eq!(store.load("node-1").unwrap(), Some(saved));
        assert!(!dir
            .path()
            .join("machines/node-1/node.json.tmp")
            .exists());
    }

    #[test]
    fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().to_path_buf());
        assert_eq!(store.load("ghost").unwrap(), None);
    }

    #[test]
    fn tampered_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().to_path_buf());
        store.save(&node(&store)).unwrap();

        let path = dir.path().join("machines/node-1/node.json");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("10.0.0.5", "10.0.0.6")).unwrap();

        let err = store.load("node-1").unwrap_err();
        assert!(err.to_string().contains("checksum verification failed"));
    }

    #[test]
    fn delete_removes_keys_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().to_path_buf());
        let saved = node(&store);
        store.save(&saved).unwrap();
        std::fs::write(&saved.ssh_key_path, "key").unwrap();

        store.delete("node-1").unwrap();
        assert!(!store.machine_dir("node-1").exists());
        store.delete("node-1").unwrap();
    }
}
