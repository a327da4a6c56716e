//! Driver configuration: defaults, then a YAML file, then `CDI_` env vars.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::fabric::models::{self, Condition, MachineSpec, Resource, SubnetSpec};
use crate::identity::Credentials;
use crate::ssh::shell::HostKey;

const APP_DIR: &str = "cdi-node-driver";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub api_url: String,
    pub tenant_uuid: String,
    pub credentials: CredentialsConfig,
    pub ssh: SshConfig,
    pub ntp_server: String,
    pub dns_server: String,
    pub compute_conditions: Vec<Condition>,
    pub devices: Vec<Resource>,
    pub network: NetworkConfig,
    pub os_image: OsImageConfig,
    pub registration: RegistrationConfig,
    pub user_data_file: Option<PathBuf>,
    pub timeouts: Timeouts,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub password: String,
    /// authorized_keys format, e.g. `ssh-ed25519 AAAA...`
    pub host_public_key: String,
    pub key_path: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "rancher".into(),
            password: "rancher".into(),
            host_public_key: String::new(),
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub provision: SubnetSpec,
    pub baremetal: Option<SubnetSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OsImageConfig {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub code: String,
    pub email: String,
}

/// Poll bounds, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub poll_step_secs: u64,
    pub status_secs: u64,
    pub install_secs: u64,
    pub stop_secs: u64,
    pub remove_secs: u64,
    pub reboot_settle_secs: u64,
    pub ssh_connect_attempts: u32,
    pub ssh_connect_delay_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_step_secs: 5,
            status_secs: 30 * 60,
            install_secs: 30 * 60,
            stop_secs: 15,
            remove_secs: 15,
            reboot_settle_secs: 60,
            ssh_connect_attempts: 20,
            ssh_connect_delay_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.poll_step_secs)
    }

    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn remove(&self) -> Duration {
        Duration::from_secs(self.remove_secs)
    }

    pub fn reboot_settle(&self) -> Duration {
        Duration::from_secs(self.reboot_settle_secs)
    }

    pub fn ssh_connect_delay(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl DriverConfig {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| DriverError::config("could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("config.yaml"))
    }

    /// Where node records and generated SSH keys live unless overridden.
    pub fn default_store_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| DriverError::config("could not determine data directory"))?;
        Ok(data_dir.join(APP_DIR))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(DriverConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed("CDI_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: DriverConfig = figment
            .extract()
            .map_err(|e| DriverError::config(format!("loading configuration: {e}")))?;
        config.fill_client_from_env();
        Ok(config)
    }

    /// The identity client id/secret come from the plain environment when
    /// the config leaves them empty.
    fn fill_client_from_env(&mut self) {
        if self.credentials.client_id.is_empty() {
            self.credentials.client_id = std::env::var("CLIENT_ID").unwrap_or_default();
        }
        if self.credentials.client_secret.is_empty() {
            self.credentials.client_secret = std::env::var("CLIENT_SECRET").unwrap_or_default();
        }
    }

    /// Mandatory fields, checked before any remote call.
    pub fn validate(&self) -> Result<()> {
        let required = [
            (&self.api_url, "API URL", "api_url"),
            (&self.tenant_uuid, "Tenant UUID", "tenant_uuid"),
            (&self.credentials.username, "Username", "credentials.username"),
            (&self.credentials.password, "Password", "credentials.password"),
            (&self.ssh.user, "SSH user", "ssh.user"),
            (&self.ssh.password, "SSH password", "ssh.password"),
            (
                &self.network.provision.subnet_uuid,
                "Provisioning subnet UUID",
                "network.provision.subnet_uuid",
            ),
            (
                &self.network.provision.default_gw,
                "Provisioning subnet default GW",
                "network.provision.default_gw",
            ),
            (&self.os_image.name, "OS image name", "os_image.name"),
            (
                &self.ssh.host_public_key,
                "OS image ssh host public key",
                "ssh.host_public_key",
            ),
        ];
        for (value, what, key) in required {
            if value.is_empty() {
                return Err(DriverError::mandatory(what, key));
            }
        }

        if self.compute_conditions.is_empty() {
            return Err(DriverError::mandatory("Compute conditions", "compute_conditions"));
        }
        if self.devices.is_empty() {
            return Err(DriverError::mandatory("Devices specification", "devices"));
        }
        if models::boot_storage_condition(&self.devices).is_none() {
            return Err(DriverError::config(
                "mandatory field 'tags.is_bootstorage' must be true for at least one resource of type 'storage' in devices",
            ));
        }

        HostKey::parse(&self.ssh.host_public_key)?;

        if !self.registration.code.is_empty() {
            if self.registration.email.is_empty() {
                return Err(DriverError::config(
                    "when registration.code is set registration.email must also be set",
                ));
            }
            if !is_valid_email(&self.registration.email) {
                return Err(DriverError::config(format!(
                    "Email address is not valid: {}",
                    self.registration.email
                )));
            }
        }

        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            realm: self.tenant_uuid.clone(),
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            client_id: self.credentials.client_id.clone(),
            client_secret: self.credentials.client_secret.clone(),
        }
    }

    pub fn machine_spec(&self) -> MachineSpec {
        MachineSpec {
            compute_conditions: self.compute_conditions.clone(),
            devices: self.devices.clone(),
            provision: self.network.provision.clone(),
            baremetal: self.network.baremetal.clone(),
            ntp_server: self.ntp_server.clone(),
            dns_server: self.dns_server.clone(),
        }
    }

    pub fn baremetal_subnet(&self) -> Option<&str> {
        self.network
            .baremetal
            .as_ref()
            .map(|b| b.subnet_uuid.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// `local@domain.tld` with no whitespace; a syntax check, not a deliverability one.
fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !address.chars().any(char::is_whitespace)
        && domain
            .split('.')
            .filter(|label| !label.is_empty())
            .count()
            >= 2
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
