//! SSH executor built on a [`RemoteShell`].

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::shell::{public_key_path, ExitStatus, RemoteShell, SshAuth};
use super::SshExecutor;
use crate::errors::{DriverError, Result};

/// Scratch directory for scripts that are not given an explicit path.
pub const SCRATCH_DIR: &str = "/tmp/cdi-node-driver";

const CMD_REBOOT_CLOUD_INIT: &str = "sudo cloud-init clean --logs --reboot";
const CMD_STATUS_OS: &str = "sudo -E SUSEConnect -s";
const CMD_DEREGISTER_OS: &str = "sudo -E SUSEConnect -d";

const DISABLE_PASSWORD_COMMANDS: &[&str] = &[
    "sudo cp /etc/ssh/sshd_config /etc/ssh/sshd_config.bak",
    r#"echo "PasswordAuthentication no" | sudo tee /etc/ssh/sshd_config.d/99-disable-password.conf"#,
    r#"echo "AuthenticationMethods publickey" | sudo tee /etc/ssh/sshd_config.d/99-auth-methods.conf"#,
    "sudo systemctl reload sshd",
];

#[derive(Debug, Deserialize)]
struct SuseProduct {
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    arch: String,
    #[serde(default)]
    status: String,
}

pub struct StandardSshExecutor {
    shell: Box<dyn RemoteShell>,
    key_path: PathBuf,
    reachable: bool,
}

impl StandardSshExecutor {
    pub fn new(shell: Box<dyn RemoteShell>, key_path: PathBuf) -> Self {
        Self {
            shell,
            key_path,
            reachable: false,
        }
    }

    fn ensure_reachable(&mut self) -> Result<()> {
        if !self.reachable {
            self.shell.wait_until_reachable()?;
            self.reachable = true;
        }
        Ok(())
    }

    fn run(&mut self, command: &str) -> Result<String> {
        self.ensure_reachable()?;
        run_checked(self.shell.as_mut(), command, command, None)
    }

    /// Like `run`, but logs `shown` in place of the command text.
    fn run_masked(&mut self, command: &str, shown: &str) -> Result<String> {
        self.ensure_reachable()?;
        run_checked(self.shell.as_mut(), command, shown, None)
    }

    fn product_status(&mut self) -> Result<Vec<SuseProduct>> {
        let json = self.run(CMD_STATUS_OS)?;
        serde_json::from_str(json.trim()).map_err(|e| {
            DriverError::ssh(
                self.shell.host(),
                format!("parsing SUSE product status JSON: {e}"),
            )
        })
    }
}

fn is_reboot(command: &str) -> bool {
    command.contains("reboot") || command.contains("shutdown")
}

/// Run a command and insist on exit status 0. A lost session is accepted
/// only for reboot-like commands.
fn run_checked(
    shell: &mut dyn RemoteShell,
    command: &str,
    shown: &str,
    stdin: Option<&[u8]>,
) -> Result<String> {
    debug!(host = shell.host(), user = shell.user(), command = shown, "running command via ssh");
    let out = shell.run(command, stdin)?;

    match out.exit {
        ExitStatus::Code(0) => Ok(out.stdout),
        ExitStatus::Missing if is_reboot(command) => {
            debug!(command = shown, "ssh session interrupted by restart");
            Ok(out.stdout)
        }
        ExitStatus::Code(code) => {
            error!(command = shown, code, stderr = %out.stderr.trim(), "error running command");
            Err(DriverError::ssh(
                shell.host(),
                format!("'{shown}' exited with status {code}: {}", out.stderr.trim()),
            ))
        }
        ExitStatus::Missing => {
            error!(command = shown, stderr = %out.stderr.trim(), "command ended without exit status");
            Err(DriverError::ssh(
                shell.host(),
                format!("'{shown}' ended without an exit status: {}", out.stderr.trim()),
            ))
        }
    }
}

fn random_script_path(user: &str) -> String {
    let n: u32 = rand::rng().random_range(1..=999);
    let path = format!("{SCRATCH_DIR}/{user}-via-ssh-{n:03}.sh");
    debug!(path = %path, "generated random script path");
    path
}

/// POSIX single-quoting; words made only of safe characters pass through.
fn quote(s: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_=/,.+".contains(c);
    if !s.is_empty() && s.chars().all(safe) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
}

/// A script written to the node. Dropping it removes the file (when asked
/// to) and the scratch directory once it is empty, on every exit path.
struct RemoteScript<'a> {
    shell: &'a mut dyn RemoteShell,
    path: String,
    remove_after: bool,
    use_sudo: bool,
}

impl RemoteScript<'_> {
    fn sudo(&self) -> &'static str {
        if self.use_sudo {
            "sudo "
        } else {
            ""
        }
    }

    fn execute(mut self) -> Result<()> {
        let command = format!("{}{}", self.sudo(), quote(&self.path));
        run_checked(&mut *self.shell, &command, &command, None)?;
        info!(path = %self.path, "script executed");
        Ok(())
    }
}

impl Drop for RemoteScript<'_> {
    fn drop(&mut self) {
        let sudo = self.sudo();
        if self.remove_after {
            let command = format!("{sudo}rm {}", quote(&self.path));
            if let Err(e) = run_checked(&mut *self.shell, &command, &command, None) {
                error!(path = %self.path, error = %e, "failed to remove remote script file");
            }
        }

        let command = format!(
            r#"if [ -d {dir} ] && [ -z "$(ls -A {dir})" ]; then {sudo}rmdir {dir}; fi"#,
            dir = SCRATCH_DIR
        );
        if let Err(e) = run_checked(&mut *self.shell, &command, &command, None) {
            error!(dir = SCRATCH_DIR, error = %e, "failed to remove remote directory");
        }
    }
}

impl SshExecutor for StandardSshExecutor {
    fn exchange_keys(&mut self) -> Result<()> {
        self.ensure_reachable()?;
        self.shell.generate_key_pair(&self.key_path)?;

        let pub_path = public_key_path(&self.key_path);
        let public_key = std::fs::read_to_string(&pub_path).map_err(|e| {
            DriverError::ssh(
                self.shell.host(),
                format!("reading {}: {e}", pub_path.display()),
            )
        })?;

        let command = format!(
            "mkdir -p $HOME/.ssh && chmod 700 $HOME/.ssh && echo {} >> $HOME/.ssh/authorized_keys",
            quote(public_key.trim())
        );
        self.run(&command)?;

        self.shell.set_auth(SshAuth::Key(self.key_path.clone()));
        info!(path = %self.key_path.display(), "SSH key pair exchanged");
        Ok(())
    }

    fn execute_script(
        &mut self,
        path: Option<&str>,
        body: &str,
        remove_after: bool,
        use_sudo: bool,
    ) -> Result<()> {
        self.ensure_reachable()?;

        let path = match path {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => random_script_path(self.shell.user()),
        };

        let dir = Path::new(&path)
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let dir_q = quote(&dir);
        if let Err(e) = self.run(&format!("mkdir -p {dir_q} && chmod 700 {dir_q}")) {
            warn!(dir = %dir, error = %e, "failed to ensure script directory permissions");
        }

        self.write_remote_file(&path, body.as_bytes(), 0o744)?;

        RemoteScript {
            shell: self.shell.as_mut(),
            path,
            remove_after,
            use_sudo,
        }
        .execute()
    }

    fn write_remote_file(&mut self, path: &str, content: &[u8], mode: u32) -> Result<()> {
        self.ensure_reachable()?;
        let p = quote(path);
        let command = format!("umask 077 && cat > {p} && chmod {mode:o} {p}");
        run_checked(self.shell.as_mut(), &command, &command, Some(content))?;
        info!(path, mode = %format!("{mode:04o}"), "file written to remote destination");
        Ok(())
    }

    fn reboot_cloud_init(&mut self) -> Result<()> {
        self.run(CMD_REBOOT_CLOUD_INIT)?;
        // sessions opened before the reboot are gone
        self.reachable = false;
        info!("cloud-init reboot executed");
        Ok(())
    }

    fn register_os(&mut self, code: &str, email: &str) -> Result<()> {
        if code.is_empty() {
            info!("OS registration skipped: no registration code provided");
            return Ok(());
        }

        info!(email, "attempting initial OS registration");
        let command = format!("sudo -E SUSEConnect -r {} -e {}", quote(code), quote(email));
        let shown = format!("sudo -E SUSEConnect -r [REDACTED] -e {}", quote(email));
        self.run_masked(&command, &shown)?;

        for product in self.product_status()? {
            if product.status != "Not Registered" {
                continue;
            }
            let module = format!("{}/{}/{}", product.identifier, product.version, product.arch);
            info!(module = %module, "registering module");
            self.run(&format!("sudo -E SUSEConnect -p {}", quote(&module)))?;
        }

        info!("OS and all modules registered");
        Ok(())
    }

    fn deregister_os(&mut self) -> Result<()> {
        let products = self.product_status()?;
        if !products.iter().any(|p| p.status == "Registered") {
            info!("skipping OS deregistration: no products registered");
            return Ok(());
        }
        self.run(CMD_DEREGISTER_OS)?;
        info!("OS deregistered");
        Ok(())
    }

    fn disable_password_login(&mut self) -> Result<()> {
        for command in DISABLE_PASSWORD_COMMANDS {
            self.run(command)?;
        }
        info!("password authentication disabled");
        Ok(())
    }
}
