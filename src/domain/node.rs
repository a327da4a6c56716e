//! Node: the driver's view of one machine across invocations.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the driver remembers about a node between commands. Empty strings
/// mean "not known yet"; an empty `machine_uuid` means nothing was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub machine_name: String,
    #[serde(default)]
    pub machine_uuid: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub private_ip_address: String,
    pub ssh_key_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(machine_name: impl Into<String>, ssh_key_path: PathBuf) -> Self {
        Self {
            machine_name: machine_name.into(),
            machine_uuid: String::new(),
            ip_address: String::new(),
            private_ip_address: String::new(),
            ssh_key_path,
            created_at: Utc::now(),
        }
    }

    pub fn machine_uuid(&self) -> Option<&str> {
        Some(self.machine_uuid.as_str()).filter(|u| !u.is_empty())
    }
}
