//! Lifecycle orchestration of one bare-metal node.
//!
//! Every public operation wraps its failure exactly once in
//! [`DriverError::Lifecycle`]; the `*_inner` steps compose without wrapping.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::cloud_init::{ConfigBuilder, StandardConfigBuilder, WriteFile};
use crate::config::DriverConfig;
use crate::domain::network;
use crate::domain::node::Node;
use crate::domain::poller::StatusPoller;
use crate::domain::status::{LifecycleState, MachineStatus};
use crate::errors::{DriverError, Operation, Result};
use crate::fabric::{FabricClient, HttpFabricClient};
use crate::identity::{IdentityClient, KeycloakClient};
use crate::ssh::shell::{HostKey, OpenSshShell, SshAuth};
use crate::ssh::{SessionKind, SshExecutor, StandardSshExecutor};

const PROVIDER_ID_CONFIG: &str = "100-fsas-providerid";
const CLOUD_INIT_DIR: &str = "/etc/cdi/cloud-init-discovery";
const CLOUD_INIT_FILE_MODE: u32 = 0o700;
const DOCKER_PORT: u16 = 2376;

const DIAGNOSTIC_RUNCMD_LOG: &str = "/tmp/cloud-config-test-runcmd.log";

// ── Collaborator construction ─────────────────────────────────

/// Builds the remote collaborators. Swapped for fakes in tests.
pub trait ClientFactory {
    fn identity(&self, config: &DriverConfig) -> Result<Box<dyn IdentityClient>>;

    fn fabric(&self, config: &DriverConfig) -> Result<Box<dyn FabricClient>>;

    /// SSH executor for the node's primary address.
    fn ssh(&self, config: &DriverConfig, node: &Node, kind: SessionKind)
        -> Result<Box<dyn SshExecutor>>;

    fn config_builder(&self, config: &DriverConfig) -> Result<Box<dyn ConfigBuilder>>;
}

/// Production collaborators: HTTP fabric and identity clients, OpenSSH.
pub struct StandardClients;

impl ClientFactory for StandardClients {
    fn identity(&self, config: &DriverConfig) -> Result<Box<dyn IdentityClient>> {
        Ok(Box::new(KeycloakClient::new(
            &config.api_url,
            config.credentials(),
        )?))
    }

    fn fabric(&self, config: &DriverConfig) -> Result<Box<dyn FabricClient>> {
        Ok(Box::new(HttpFabricClient::new(
            &config.api_url,
            &config.devices,
        )?))
    }

    fn ssh(
        &self,
        config: &DriverConfig,
        node: &Node,
        kind: SessionKind,
    ) -> Result<Box<dyn SshExecutor>> {
        if node.ip_address.is_empty() {
            return Err(DriverError::MissingIpAddress);
        }
        let host_key = HostKey::parse(&config.ssh.host_public_key)?;
        let state_dir = node
            .ssh_key_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let auth = if kind.use_key() && node.ssh_key_path.exists() {
            SshAuth::Key(node.ssh_key_path.clone())
        } else {
            SshAuth::Password(config.ssh.password.clone())
        };

        let shell = OpenSshShell::new(
            &node.ip_address,
            &config.ssh.user,
            host_key,
            &state_dir,
            auth,
            kind.connect_retry(&config.timeouts),
            Box::new(SystemClock),
        )?;
        Ok(Box::new(StandardSshExecutor::new(
            Box::new(shell),
            node.ssh_key_path.clone(),
        )))
    }

    fn config_builder(&self, config: &DriverConfig) -> Result<Box<dyn ConfigBuilder>> {
        Ok(Box::new(StandardConfigBuilder::new(
            config.devices.clone(),
            config.user_data_file.as_deref(),
        )?))
    }
}

// ── Orchestrator ──────────────────────────────────────────────

pub struct Driver<'a> {
    config: &'a DriverConfig,
    clock: &'a dyn Clock,
    clients: &'a dyn ClientFactory,
    node: Node,
    identity: Option<Box<dyn IdentityClient>>,
    fabric: Option<Box<dyn FabricClient>>,
    ssh: Option<Box<dyn SshExecutor>>,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: &'a DriverConfig,
        clock: &'a dyn Clock,
        clients: &'a dyn ClientFactory,
        node: Node,
    ) -> Self {
        Self {
            config,
            clock,
            clients,
            node,
            identity: None,
            fabric: None,
            ssh: None,
        }
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    fn fail(&self, operation: Operation, err: DriverError) -> DriverError {
        error!(
            operation = %operation,
            machine_name = %self.node.machine_name,
            machine_uuid = %self.node.machine_uuid,
            error = %err,
            "operation failed"
        );
        err.during(operation, self.node.machine_uuid())
    }

    fn require_uuid(&self, operation: Operation) -> Result<String> {
        self.node
            .machine_uuid()
            .map(str::to_string)
            .ok_or(DriverError::MissingMachineUuid { operation })
    }

    // ── Collaborators ──

    /// Identity then fabric; skipped once both exist.
    fn init_clients(&mut self) -> Result<()> {
        if self.identity.is_none() {
            let mut identity = self.clients.identity(self.config)?;
            identity.init_connection()?;
            identity.validate_user_authorization()?;
            self.identity = Some(identity);
        }
        if self.fabric.is_none() {
            self.fabric = Some(self.clients.fabric(self.config)?);
        }
        Ok(())
    }

    fn token(&mut self) -> Result<String> {
        self.init_clients()?;
        match self.identity.as_mut() {
            Some(identity) => identity.token(),
            None => Err(DriverError::Identity("client not initialized".into())),
        }
    }

    fn fabric(&self) -> Result<&dyn FabricClient> {
        match &self.fabric {
            Some(fabric) => Ok(&**fabric),
            None => Err(DriverError::config("fabric client not initialized")),
        }
    }

    /// Bootstrap session, opened once and reused.
    fn ssh(&mut self) -> Result<&mut dyn SshExecutor> {
        let ssh = match self.ssh.take() {
            Some(ssh) => ssh,
            None => self
                .clients
                .ssh(self.config, &self.node, SessionKind::Bootstrap)?,
        };
        let ssh: &mut dyn SshExecutor = &mut **self.ssh.insert(ssh);
        Ok(ssh)
    }

    fn query_status(&mut self, machine_uuid: &str) -> Result<MachineStatus> {
        let token = self.token()?;
        let details = self
            .fabric()?
            .machine_details(&self.config.tenant_uuid, machine_uuid, &token)?;
        Ok(MachineStatus::from_code(details.status_code))
    }

    fn wait_for(
        &mut self,
        machine_uuid: &str,
        expected: MachineStatus,
        timeout: Duration,
    ) -> Result<()> {
        let clock = self.clock;
        let step = self.config.timeouts.step();
        info!(machine_uuid, status = %expected, timeout_secs = timeout.as_secs(), "waiting for status");
        StatusPoller::new(clock, machine_uuid).wait_for(expected, step, timeout, || {
            self.query_status(machine_uuid)
        })
    }

    // ── PreCreateCheck ──

    /// Validate configuration, the user's authorization and the tenant.
    pub fn pre_create_check(&mut self) -> Result<()> {
        self.pre_create_check_inner()
            .map_err(|e| self.fail(Operation::PreCreateCheck, e))
    }

    fn pre_create_check_inner(&mut self) -> Result<()> {
        self.config.validate()?;
        let token = self.token()?;
        self.fabric()?
            .validate_tenant(&self.config.tenant_uuid, &token)?;
        info!(tenant_uuid = %self.config.tenant_uuid, "pre-create check passed");
        Ok(())
    }

    // ── Create ──

    /// Compose, install, boot and bootstrap the node. On failure the partial
    /// machine is removed before the error is returned.
    pub fn create(&mut self) -> Result<()> {
        if let Err(e) = self.config.validate() {
            return Err(self.fail(Operation::Create, e));
        }

        let Err(err) = self.create_inner() else {
            return Ok(());
        };
        error!(error = %err, "error encountered during instance creation");

        let Some(machine_uuid) = self.node.machine_uuid().map(str::to_string) else {
            info!("no machine was created, nothing to remove");
            return Err(self.fail(Operation::Create, err));
        };
        info!(machine_uuid = %machine_uuid, "attempting to remove partially created machine");

        let outcome = match self.remove_inner() {
            Ok(()) => DriverError::CreateRolledBack {
                machine_uuid: machine_uuid.clone(),
                source: Box::new(err),
            },
            Err(remove_err) => {
                error!(error = %remove_err, "removing partially provisioned machine failed");
                DriverError::RollbackFailed {
                    create: Box::new(err),
                    remove: Box::new(remove_err),
                }
            }
        };
        error!(operation = %Operation::Create, error = %outcome, "operation failed");
        Err(outcome.during(Operation::Create, Some(&machine_uuid)))
    }

    fn create_inner(&mut self) -> Result<()> {
        let config = self.config;
        let timeouts = &config.timeouts;

        self.init_clients()?;

        let token = self.token()?;
        let machine_uuid = self.fabric()?.create_machine(
            &self.node.machine_name,
            &config.tenant_uuid,
            &config.machine_spec(),
            &token,
        )?;
        info!(machine_uuid = %machine_uuid, machine_name = %self.node.machine_name, "machine created");
        self.node.machine_uuid = machine_uuid.clone();

        self.wait_for(&machine_uuid, MachineStatus::ActivePowerOff, timeouts.status())?;

        let token = self.token()?;
        let details = self
            .fabric()?
            .machine_details(&config.tenant_uuid, &machine_uuid, &token)?;
        let storage_id = details
            .boot_storage_id
            .ok_or_else(|| DriverError::BootStorageNotFound {
                machine_uuid: machine_uuid.clone(),
            })?;

        let token = self.token()?;
        self.fabric()?
            .install_image(&config.tenant_uuid, &storage_id, &config.os_image.name, &token)?;
        info!(storage_id = %storage_id, image = %config.os_image.name, "OS image installation requested");

        self.wait_for(&machine_uuid, MachineStatus::OsInstalling, timeouts.install())?;
        self.wait_for(&machine_uuid, MachineStatus::ActivePowerOff, timeouts.install())?;

        self.start_inner()?;
        self.resolve_addresses(&machine_uuid)?;
        self.bootstrap(&machine_uuid)
    }

    fn resolve_addresses(&mut self, machine_uuid: &str) -> Result<()> {
        let config = self.config;
        let token = self.token()?;
        let details = self
            .fabric()?
            .machine_details(&config.tenant_uuid, machine_uuid, &token)?;

        let addresses = network::resolve_addresses(
            &details.lanports,
            &config.network.provision.subnet_uuid,
            config.baremetal_subnet(),
        )?;
        self.node.ip_address = addresses.primary;
        self.node.private_ip_address = addresses.private.unwrap_or_default();
        Ok(())
    }

    /// Keys, registration, provider id, cloud-init, then lock down SSH.
    fn bootstrap(&mut self, machine_uuid: &str) -> Result<()> {
        let config = self.config;
        let clock = self.clock;
        let hostname = self.node.machine_name.clone();
        let mut builder = self.clients.config_builder(config)?;

        let ssh = self.ssh()?;
        ssh.exchange_keys()?;
        ssh.register_os(&config.registration.code, &config.registration.email)?;

        builder.extend_startup_commands(&[
            format!(r#"echo "Boot completed at $(date)" >> {DIAGNOSTIC_RUNCMD_LOG}"#),
            format!(r#"echo "Cloud config test succeeded" >> {DIAGNOSTIC_RUNCMD_LOG}"#),
        ])?;
        builder.extend_startup_files(&[
            WriteFile::new(
                "/tmp/cloud-config-test-write-files.log",
                "Cloud config succeeded for write_files",
            ),
            WriteFile::new(
                "/tmp/cloud-config-test-write-files-2.log",
                "Cloud config succeeded for write_files part 2",
            ),
        ])?;

        let script = builder.render_provider_id_script(PROVIDER_ID_CONFIG, machine_uuid);
        ssh.execute_script(None, &script, true, true)?;

        if let Some(user_data) = builder.user_data()? {
            debug!(content = %user_data, "extended cloud-config user data");
            ssh.write_remote_file(
                &format!("{CLOUD_INIT_DIR}/user-data"),
                user_data.as_bytes(),
                CLOUD_INIT_FILE_MODE,
            )?;
        }
        let metadata = builder.render_instance_metadata(machine_uuid, &hostname);
        ssh.write_remote_file(
            &format!("{CLOUD_INIT_DIR}/meta-data"),
            metadata.as_bytes(),
            CLOUD_INIT_FILE_MODE,
        )?;

        ssh.reboot_cloud_init()?;
        info!(
            settle_secs = config.timeouts.reboot_settle_secs,
            "waiting for the node to come back from cloud-init reboot"
        );
        clock.sleep(config.timeouts.reboot_settle());

        ssh.disable_password_login()?;
        info!(machine_uuid, "node bootstrapped");
        Ok(())
    }

    // ── Power ──

    pub fn start(&mut self) -> Result<()> {
        self.start_inner().map_err(|e| self.fail(Operation::Start, e))
    }

    fn start_inner(&mut self) -> Result<()> {
        let machine_uuid = self.require_uuid(Operation::Start)?;
        let token = self.token()?;
        self.fabric()?
            .power_on(&machine_uuid, &self.config.tenant_uuid, &token)?;
        self.wait_for(
            &machine_uuid,
            MachineStatus::ActivePowerOn,
            self.config.timeouts.status(),
        )
    }

    pub fn stop(&mut self) -> Result<()> {
        self.stop_inner().map_err(|e| self.fail(Operation::Stop, e))
    }

    fn stop_inner(&mut self) -> Result<()> {
        let machine_uuid = self.require_uuid(Operation::Stop)?;
        let token = self.token()?;
        self.fabric()?
            .graceful_shutdown(&machine_uuid, &self.config.tenant_uuid, &token)?;
        self.wait_for(
            &machine_uuid,
            MachineStatus::ActivePowerOff,
            self.config.timeouts.stop(),
        )
    }

    pub fn kill(&mut self) -> Result<()> {
        self.kill_inner().map_err(|e| self.fail(Operation::Kill, e))
    }

    fn kill_inner(&mut self) -> Result<()> {
        let machine_uuid = self.require_uuid(Operation::Kill)?;
        let token = self.token()?;
        self.fabric()?
            .power_off(&machine_uuid, &self.config.tenant_uuid, &token)?;
        self.wait_for(
            &machine_uuid,
            MachineStatus::ActivePowerOff,
            self.config.timeouts.stop(),
        )
    }

    /// Stop then start; the first failure ends the restart.
    pub fn restart(&mut self) -> Result<()> {
        debug!(machine_name = %self.node.machine_name, "restarting node");
        self.stop_inner()
            .and_then(|()| self.start_inner())
            .map_err(|e| self.fail(Operation::Restart, e))
    }

    // ── Remove ──

    pub fn remove(&mut self) -> Result<()> {
        self.remove_inner().map_err(|e| self.fail(Operation::Remove, e))
    }

    fn remove_inner(&mut self) -> Result<()> {
        // A node whose creation never got a UUID must still be removable,
        // otherwise the host retries the removal forever.
        let Some(machine_uuid) = self.node.machine_uuid().map(str::to_string) else {
            warn!(machine_name = %self.node.machine_name, "machine uuid is empty, nothing to remove");
            return Ok(());
        };

        self.init_clients()?;
        self.deregister_os();

        let token = self.token()?;
        self.fabric()?
            .remove_machine(&machine_uuid, &self.config.tenant_uuid, &token)?;
        self.wait_for(
            &machine_uuid,
            MachineStatus::Unbuilded,
            self.config.timeouts.remove(),
        )?;

        info!(machine_uuid = %machine_uuid, "machine removed");
        self.node.machine_uuid.clear();
        self.node.ip_address.clear();
        self.node.private_ip_address.clear();
        Ok(())
    }

    /// Losing a license registration is recoverable; losing the machine
    /// record is not. Failures here are only logged.
    ///
    /// Runs on its own session so a host that is down costs one dial, not
    /// the bootstrap wait.
    fn deregister_os(&mut self) {
        if self.node.ip_address.is_empty() {
            warn!(machine_name = %self.node.machine_name, "no SSH host known, skipping OS deregistration");
            return;
        }
        let deregistered = self
            .clients
            .ssh(self.config, &self.node, SessionKind::BestEffort)
            .and_then(|mut ssh| ssh.deregister_os());
        if let Err(e) = deregistered {
            warn!(error = %e, "could not deregister OS, manual action might be required");
        }
    }

    // ── Queries ──

    pub fn state(&mut self) -> Result<LifecycleState> {
        self.state_inner().map_err(|e| self.fail(Operation::GetState, e))
    }

    fn state_inner(&mut self) -> Result<LifecycleState> {
        let machine_uuid = self.require_uuid(Operation::GetState)?;
        let status = self.query_status(&machine_uuid)?;
        debug!(machine_uuid = %machine_uuid, status = %status, "machine status");
        Ok(status.lifecycle())
    }

    pub fn ip(&self) -> Result<String> {
        if self.node.ip_address.is_empty() {
            return Err(self.fail(Operation::GetIp, DriverError::MissingIpAddress));
        }
        Ok(self.node.ip_address.clone())
    }

    pub fn url(&self) -> Result<String> {
        if self.node.ip_address.is_empty() {
            return Err(self.fail(Operation::GetUrl, DriverError::MissingIpAddress));
        }
        Ok(format!("tcp://{}:{DOCKER_PORT}", self.node.ip_address))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;

    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::ssh::shell::ConnectRetry;
    use crate::fabric::models::{
        Condition, Lanport, MachineDetails, MachineSpec, ResSpec, Resource, StorageTags,
        SubnetSpec,
    };

    const MACHINE_UUID: &str = "ff3a4a18-1ef9-4e17-9c8d-eec35b3c638f";
    const HOST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    // ── Fakes ──

    /// Shared state behind every fake. Fabric calls move the machine
    /// through `transitions`; each status query applies the next step.
    struct World {
        /// (method, machine uuid); the uuid is empty for tenant-level calls.
        fabric_calls: Vec<(&'static str, String)>,
        ssh_calls: Vec<String>,
        ssh_sessions: Vec<SessionKind>,
        /// Every SSH dial fails while set.
        unreachable: bool,
        dials: u32,
        identity_inits: usize,
        fail: Vec<&'static str>,
        transitions: HashMap<&'static str, Vec<MachineStatus>>,
        pending: VecDeque<MachineStatus>,
        status: MachineStatus,
        lanports: Vec<Lanport>,
    }

    impl World {
        fn new() -> Rc<RefCell<Self>> {
            use MachineStatus::*;
            let transitions = HashMap::from([
                ("create_machine", vec![Building, ActivePowerOff]),
                ("install_image", vec![OsInstalling, ActivePowerOff]),
                ("power_on", vec![Booting, ActivePowerOn]),
                ("graceful_shutdown", vec![PoweringOff, ActivePowerOff]),
                ("power_off", vec![ActivePowerOff]),
                ("remove_machine", vec![Unbuilding, Unbuilded]),
            ]);
            Rc::new(RefCell::new(Self {
                fabric_calls: Vec::new(),
                ssh_calls: Vec::new(),
                ssh_sessions: Vec::new(),
                unreachable: false,
                dials: 0,
                identity_inits: 0,
                fail: Vec::new(),
                transitions,
                pending: VecDeque::new(),
                status: ActivePowerOff,
                lanports: vec![
                    Lanport {
                        subnet_uuid: "bm".into(),
                        ip_address: "192.168.0.5".into(),
                        ..Default::default()
                    },
                    Lanport {
                        subnet_uuid: "prov".into(),
                        ip_address: "10.0.0.5".into(),
                        ..Default::default()
                    },
                ],
            }))
        }

        fn count(&self, method: &str) -> usize {
            self.fabric_calls.iter().filter(|(m, _)| *m == method).count()
        }

        fn uuids(&self, method: &str) -> Vec<&str> {
            self.fabric_calls
                .iter()
                .filter(|(m, _)| *m == method)
                .map(|(_, uuid)| uuid.as_str())
                .collect()
        }

        /// Fabric calls that change the machine, in order.
        fn actions(&self) -> Vec<&'static str> {
            self.fabric_calls
                .iter()
                .map(|(m, _)| *m)
                .filter(|m| *m != "machine_details")
                .collect()
        }
    }

    fn injected(method: &str) -> DriverError {
        DriverError::Fabric {
            method: "PUT",
            endpoint: format!("/{method}"),
            status: Some(500),
            message: format!("{method} exploded"),
        }
    }

    struct FakeFabric(Rc<RefCell<World>>);

    impl FakeFabric {
        fn call(&self, method: &'static str, machine_uuid: &str) -> Result<()> {
            let mut world = self.0.borrow_mut();
            world.fabric_calls.push((method, machine_uuid.to_string()));
            if world.fail.contains(&method) {
                return Err(injected(method));
            }
            if let Some(steps) = world.transitions.get(method).cloned() {
                world.pending = steps.into();
            }
            Ok(())
        }
    }

    impl FabricClient for FakeFabric {
        fn validate_tenant(&self, _: &str, _: &str) -> Result<()> {
            self.call("validate_tenant", "")
        }

        fn create_machine(&self, _: &str, _: &str, _: &MachineSpec, _: &str) -> Result<String> {
            self.call("create_machine", "")?;
            Ok(MACHINE_UUID.into())
        }

        fn machine_details(&self, _: &str, machine_uuid: &str, _: &str) -> Result<MachineDetails> {
            self.call("machine_details", machine_uuid)?;
            let mut world = self.0.borrow_mut();
            if let Some(next) = world.pending.pop_front() {
                world.status = next;
            }
            Ok(MachineDetails {
                lanports: world.lanports.clone(),
                boot_storage_id: Some("ssd-1".into()),
                status_code: world.status.code(),
            })
        }

        fn power_on(&self, machine_uuid: &str, _: &str, _: &str) -> Result<()> {
            self.call("power_on", machine_uuid)
        }

        fn power_off(&self, machine_uuid: &str, _: &str, _: &str) -> Result<()> {
            self.call("power_off", machine_uuid)
        }

        fn graceful_shutdown(&self, machine_uuid: &str, _: &str, _: &str) -> Result<()> {
            self.call("graceful_shutdown", machine_uuid)
        }

        fn install_image(&self, machine_uuid: &str, _: &str, _: &str, _: &str) -> Result<()> {
            self.call("install_image", machine_uuid)
        }

        fn remove_machine(&self, machine_uuid: &str, _: &str, _: &str) -> Result<()> {
            self.call("remove_machine", machine_uuid)
        }
    }

    struct FakeIdentity(Rc<RefCell<World>>);

    impl IdentityClient for FakeIdentity {
        fn init_connection(&mut self) -> Result<()> {
            self.0.borrow_mut().identity_inits += 1;
            Ok(())
        }

        fn validate_user_authorization(&self) -> Result<()> {
            Ok(())
        }

        fn token(&mut self) -> Result<String> {
            Ok("token".into())
        }
    }

    struct FakeSsh {
        world: Rc<RefCell<World>>,
        retry: ConnectRetry,
        reachable: bool,
    }

    impl FakeSsh {
        fn call(&mut self, name: String) -> Result<()> {
            let mut world = self.world.borrow_mut();
            if !self.reachable {
                if world.unreachable {
                    world.dials += self.retry.attempts;
                    return Err(DriverError::ssh(
                        "10.0.0.5",
                        format!("not reachable after {} attempts", self.retry.attempts),
                    ));
                }
                world.dials += 1;
                self.reachable = true;
            }
            let failing = world.fail.iter().any(|f| name.starts_with(f));
            world.ssh_calls.push(name.clone());
            if failing {
                return Err(DriverError::ssh("10.0.0.5", format!("{name} exploded")));
            }
            Ok(())
        }
    }

    impl SshExecutor for FakeSsh {
        fn exchange_keys(&mut self) -> Result<()> {
            self.call("exchange_keys".into())
        }

        fn execute_script(
            &mut self,
            path: Option<&str>,
            body: &str,
            remove_after: bool,
            use_sudo: bool,
        ) -> Result<()> {
            assert!(path.is_none() && remove_after && use_sudo);
            assert!(body.contains(&format!("provider-id=fsas://{MACHINE_UUID}")));
            self.call("execute_script".into())
        }

        fn write_remote_file(&mut self, path: &str, _: &[u8], mode: u32) -> Result<()> {
            assert_eq!(mode, 0o700);
            self.call(format!("write_remote_file:{path}"))
        }

        fn reboot_cloud_init(&mut self) -> Result<()> {
            self.call("reboot_cloud_init".into())
        }

        fn register_os(&mut self, _: &str, _: &str) -> Result<()> {
            self.call("register_os".into())
        }

        fn deregister_os(&mut self) -> Result<()> {
            self.call("deregister_os".into())
        }

        fn disable_password_login(&mut self) -> Result<()> {
            self.call("disable_password_login".into())
        }
    }

    struct FakeClients(Rc<RefCell<World>>);

    impl ClientFactory for FakeClients {
        fn identity(&self, _: &DriverConfig) -> Result<Box<dyn IdentityClient>> {
            Ok(Box::new(FakeIdentity(self.0.clone())))
        }

        fn fabric(&self, _: &DriverConfig) -> Result<Box<dyn FabricClient>> {
            Ok(Box::new(FakeFabric(self.0.clone())))
        }

        fn ssh(
            &self,
            config: &DriverConfig,
            node: &Node,
            kind: SessionKind,
        ) -> Result<Box<dyn SshExecutor>> {
            if node.ip_address.is_empty() {
                return Err(DriverError::MissingIpAddress);
            }
            self.0.borrow_mut().ssh_sessions.push(kind);
            Ok(Box::new(FakeSsh {
                world: self.0.clone(),
                retry: kind.connect_retry(&config.timeouts),
                reachable: false,
            }))
        }

        fn config_builder(&self, config: &DriverConfig) -> Result<Box<dyn ConfigBuilder>> {
            Ok(Box::new(StandardConfigBuilder::new(config.devices.clone(), None)?))
        }
    }

    // ── Fixtures ──

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.api_url = "https://cdi.example".into();
        config.tenant_uuid = "tenant-a".into();
        config.credentials.username = "alice".into();
        config.credentials.password = "secret".into();
        config.ssh.host_public_key = HOST_KEY.into();
        config.compute_conditions = vec![Condition {
            column: "model".into(),
            operator: "eq".into(),
            value: "PRIMERGYRX2540M6".into(),
        }];
        config.devices = vec![Resource {
            res_type: "storage".into(),
            res_num: 1,
            res_spec: Some(ResSpec {
                condition: vec![Condition {
                    column: "vendor".into(),
                    operator: "eq".into(),
                    value: "samsung".into(),
                }],
            }),
            tags: Some(StorageTags {
                is_bootstorage: true,
            }),
            ..Default::default()
        }];
        config.network.provision = SubnetSpec {
            port: 0,
            subnet_uuid: "prov".into(),
            default_gw: "10.0.0.254".into(),
        };
        config.network.baremetal = Some(SubnetSpec {
            port: 1,
            subnet_uuid: "bm".into(),
            default_gw: "192.168.0.254".into(),
        });
        config.os_image.name = "sles15sp6.img".into();
        config
    }

    fn fresh_node() -> Node {
        Node::new("node-1", PathBuf::from("/nonexistent/id_rsa"))
    }

    fn created_node() -> Node {
        let mut node = fresh_node();
        node.machine_uuid = MACHINE_UUID.into();
        node.ip_address = "10.0.0.5".into();
        node
    }

    // ── Create ──

    #[test]
    fn create_runs_the_full_sequence() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        driver.create().unwrap();

        let node = driver.into_node();
        assert_eq!(node.machine_uuid, MACHINE_UUID);
        assert_eq!(node.ip_address, "10.0.0.5");
        assert_eq!(node.private_ip_address, "192.168.0.5");

        let world = world.borrow();
        assert_eq!(world.actions(), ["create_machine", "install_image", "power_on"]);
        assert_eq!(world.identity_inits, 1);
        assert_eq!(
            world.ssh_calls,
            [
                "exchange_keys",
                "register_os",
                "execute_script",
                "write_remote_file:/etc/cdi/cloud-init-discovery/meta-data",
                "reboot_cloud_init",
                "disable_password_login",
            ]
        );
        assert!(clock.sleeps().contains(&Duration::from_secs(60)));
    }

    #[test]
    fn failed_create_removes_machine_once() {
        let world = World::new();
        world.borrow_mut().fail.push("install_image");
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.create().unwrap_err();

        assert!(matches!(
            &err,
            DriverError::Lifecycle {
                operation: Operation::Create,
                source,
                ..
            } if matches!(**source, DriverError::CreateRolledBack { .. })
        ));
        assert!(err.to_string().contains("install_image exploded"));
        assert!(matches!(err.root_cause(), DriverError::Fabric { .. }));
        {
            let world = world.borrow();
            assert_eq!(world.uuids("remove_machine"), [MACHINE_UUID]);
            assert!(world
                .uuids("machine_details")
                .iter()
                .all(|uuid| *uuid == MACHINE_UUID));
            // never got an address, so no SSH session was attempted
            assert!(world.ssh_sessions.is_empty());
        }
        assert_eq!(driver.into_node().machine_uuid, "");
    }

    #[test]
    fn failed_machine_creation_has_nothing_to_roll_back() {
        let world = World::new();
        world.borrow_mut().fail.push("create_machine");
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.create().unwrap_err();

        match &err {
            DriverError::Lifecycle {
                operation: Operation::Create,
                machine_uuid: None,
                source,
            } => assert!(matches!(**source, DriverError::Fabric { .. })),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.to_string().contains("was removed"));
        assert_eq!(world.borrow().actions(), ["create_machine"]);
    }

    #[test]
    fn failed_rollback_reports_both_errors() {
        let world = World::new();
        world
            .borrow_mut()
            .fail
            .extend(["install_image", "remove_machine"]);
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let msg = driver.create().unwrap_err().to_string();

        assert!(msg.contains("error during create: '"));
        assert!(msg.contains("install_image exploded"));
        assert!(msg.contains("remove_machine exploded"));
        assert_eq!(world.borrow().uuids("remove_machine"), [MACHINE_UUID]);
        // the uuid is kept so the removal can be retried
        assert_eq!(driver.into_node().machine_uuid, MACHINE_UUID);
    }

    #[test]
    fn failed_bootstrap_deregisters_and_removes() {
        let world = World::new();
        world.borrow_mut().fail.push("disable_password_login");
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.create().unwrap_err();

        assert!(matches!(err.root_cause(), DriverError::Ssh { .. }));
        let world = world.borrow();
        assert_eq!(world.ssh_calls.last().map(String::as_str), Some("deregister_os"));
        assert_eq!(
            world.ssh_sessions,
            [SessionKind::Bootstrap, SessionKind::BestEffort]
        );
        assert_eq!(world.uuids("remove_machine"), [MACHINE_UUID]);
    }

    #[test]
    fn unreachable_node_costs_one_dial_during_rollback() {
        let world = World::new();
        world.borrow_mut().unreachable = true;
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.create().unwrap_err();

        assert!(matches!(err.root_cause(), DriverError::Ssh { .. }));
        let world = world.borrow();
        // full wait for the bootstrap, a single dial for deregistration
        assert_eq!(world.dials, config.timeouts.ssh_connect_attempts + 1);
        assert_eq!(world.uuids("remove_machine"), [MACHINE_UUID]);
    }

    #[test]
    fn invalid_config_fails_before_any_remote_call() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let mut config = config();
        config.os_image.name.clear();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.create().unwrap_err();

        assert!(matches!(err.root_cause(), DriverError::Config(_)));
        assert!(world.borrow().fabric_calls.is_empty());
        assert_eq!(world.borrow().identity_inits, 0);
    }

    // ── Power ──

    #[test]
    fn start_twice_is_fine() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        driver.start().unwrap();
        driver.start().unwrap();

        assert_eq!(world.borrow().count("power_on"), 2);
        assert_eq!(world.borrow().identity_inits, 1);
    }

    #[test]
    fn start_without_uuid_is_rejected() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.start().unwrap_err();

        assert!(matches!(
            err.root_cause(),
            DriverError::MissingMachineUuid {
                operation: Operation::Start
            }
        ));
        assert!(world.borrow().fabric_calls.is_empty());
    }

    #[test]
    fn error_state_ends_the_wait() {
        let world = World::new();
        world
            .borrow_mut()
            .transitions
            .insert("power_on", vec![MachineStatus::Booting, MachineStatus::Error]);
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        let err = driver.start().unwrap_err();

        assert!(matches!(err.root_cause(), DriverError::ErrorState { .. }));
        assert_eq!(clock.sleeps(), [Duration::from_secs(5)]);
    }

    #[test]
    fn stuck_shutdown_times_out_quickly() {
        let world = World::new();
        world
            .borrow_mut()
            .transitions
            .insert("graceful_shutdown", vec![MachineStatus::PoweringOff]);
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        let err = driver.stop().unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(clock.elapsed(), Duration::from_secs(15));
        assert!(err.to_string().starts_with("stop failed for machine"));
    }

    #[test]
    fn kill_uses_power_off() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        driver.kill().unwrap();

        assert_eq!(world.borrow().count("power_off"), 1);
        assert_eq!(world.borrow().count("graceful_shutdown"), 0);
    }

    #[test]
    fn restart_stops_at_failed_stop() {
        let world = World::new();
        world.borrow_mut().fail.push("graceful_shutdown");
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        let err = driver.restart().unwrap_err();

        assert!(matches!(
            err,
            DriverError::Lifecycle {
                operation: Operation::Restart,
                ..
            }
        ));
        assert_eq!(world.borrow().count("power_on"), 0);
    }

    #[test]
    fn restart_stops_then_starts() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        driver.restart().unwrap();

        let world = world.borrow();
        assert_eq!(world.actions(), ["graceful_shutdown", "power_on"]);
    }

    // ── Remove ──

    #[test]
    fn remove_without_uuid_succeeds_silently() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        driver.remove().unwrap();

        assert!(world.borrow().fabric_calls.is_empty());
        assert_eq!(world.borrow().identity_inits, 0);
    }

    #[test]
    fn remove_tolerates_deregistration_failure() {
        let world = World::new();
        world.borrow_mut().fail.push("deregister_os");
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        driver.remove().unwrap();

        let world = world.borrow();
        assert_eq!(world.ssh_calls, ["deregister_os"]);
        assert_eq!(world.count("remove_machine"), 1);
        assert_eq!(driver.into_node().machine_uuid, "");
    }

    #[test]
    fn remove_of_powered_off_node_dials_once() {
        let world = World::new();
        world.borrow_mut().unreachable = true;
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        driver.remove().unwrap();

        let world = world.borrow();
        assert_eq!(world.ssh_sessions, [SessionKind::BestEffort]);
        assert_eq!(world.dials, 1);
        assert!(world.ssh_calls.is_empty());
        assert_eq!(world.actions(), ["remove_machine"]);
        assert_eq!(world.uuids("remove_machine"), [MACHINE_UUID]);
    }

    // ── Queries ──

    #[test]
    fn state_maps_fabric_status() {
        let world = World::new();
        world.borrow_mut().status = MachineStatus::OsInstalling;
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, created_node());
        assert_eq!(driver.state().unwrap(), LifecycleState::Paused);
    }

    #[test]
    fn state_without_uuid_is_an_error() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        let err = driver.state().unwrap_err();

        assert!(matches!(
            err.root_cause(),
            DriverError::MissingMachineUuid {
                operation: Operation::GetState
            }
        ));
    }

    #[test]
    fn ip_and_url() {
        let world = World::new();
        let clients = FakeClients(world);
        let clock = ManualClock::new();
        let config = config();

        let driver = Driver::new(&config, &clock, &clients, created_node());
        assert_eq!(driver.ip().unwrap(), "10.0.0.5");
        assert_eq!(driver.url().unwrap(), "tcp://10.0.0.5:2376");

        let driver = Driver::new(&config, &clock, &clients, fresh_node());
        assert!(matches!(
            driver.url().unwrap_err().root_cause(),
            DriverError::MissingIpAddress
        ));
    }

    #[test]
    fn pre_create_check_validates_tenant() {
        let world = World::new();
        let clients = FakeClients(world.clone());
        let clock = ManualClock::new();
        let config = config();

        let mut driver = Driver::new(&config, &clock, &clients, fresh_node());
        driver.pre_create_check().unwrap();
        assert_eq!(world.borrow().actions(), ["validate_tenant"]);
    }
}
