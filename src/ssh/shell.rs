//! OpenSSH client processes as a remote shell.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::{DriverError, Result};

const SSH_PORT: u16 = 22;

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    /// The session went away before the command reported a status.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit == ExitStatus::Code(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    Key(PathBuf),
}

/// A command channel to one host as one user.
pub trait RemoteShell {
    fn host(&self) -> &str;

    fn user(&self) -> &str;

    fn set_auth(&mut self, auth: SshAuth);

    /// Block until the host accepts a session or the attempts run out.
    fn wait_until_reachable(&mut self) -> Result<()>;

    fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RemoteOutput>;

    /// Create a local key pair at `path` and `path.pub`.
    fn generate_key_pair(&mut self, path: &Path) -> Result<()>;
}

/// A host key in authorized_keys format (`<type> <base64> [comment]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub key_type: String,
    pub blob: String,
}

impl HostKey {
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(key_type), Some(blob)) = (fields.next(), fields.next()) else {
            return Err(DriverError::config(
                "host public key must be in authorized_keys format: '<type> <base64>'",
            ));
        };
        STANDARD
            .decode(blob)
            .map_err(|e| DriverError::config(format!("host public key is not valid base64: {e}")))?;
        Ok(Self {
            key_type: key_type.to_string(),
            blob: blob.to_string(),
        })
    }

    /// `SHA256:<base64>` as printed by `ssh-keygen -l`.
    pub fn fingerprint(&self) -> String {
        let raw = STANDARD.decode(&self.blob).unwrap_or_default();
        format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(raw)))
    }

    pub fn known_hosts_line(&self, host: &str) -> String {
        format!("{host} {} {}\n", self.key_type, self.blob)
    }
}

/// `ssh-keygen` writes the public half next to the private key.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// Write `input` and close the pipe. On failure the child is killed and
/// reaped so no zombie is left behind.
fn feed_stdin(child: &mut Child, input: &[u8]) -> std::io::Result<()> {
    let Some(mut pipe) = child.stdin.take() else {
        return Ok(());
    };
    if let Err(e) = pipe.write_all(input) {
        drop(pipe);
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }
    Ok(())
}

/// `ssh-keygen` prompts before overwriting, and with stdin closed the
/// prompt fails, so old halves of the pair go first.
fn remove_stale_keys(path: &Path) -> std::result::Result<(), String> {
    for stale in [path.to_path_buf(), public_key_path(path)] {
        match std::fs::remove_file(&stale) {
            Ok(()) => debug!(path = %stale.display(), "removed stale key"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("removing stale key {}: {e}", stale.display())),
        }
    }
    Ok(())
}

/// Bounded reachability wait before the first command and after a reboot.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub delay: Duration,
}

pub struct OpenSshShell {
    host: String,
    user: String,
    host_key: HostKey,
    known_hosts: PathBuf,
    auth: SshAuth,
    retry: ConnectRetry,
    clock: Box<dyn Clock>,
}

impl OpenSshShell {
    /// Pins `host_key` for `host` in a known_hosts file under `state_dir`.
    pub fn new(
        host: &str,
        user: &str,
        host_key: HostKey,
        state_dir: &Path,
        auth: SshAuth,
        retry: ConnectRetry,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        if host.is_empty() || user.is_empty() {
            return Err(DriverError::config("ssh host and user must not be empty"));
        }
        std::fs::create_dir_all(state_dir)
            .map_err(|e| DriverError::ssh(host, format!("creating {}: {e}", state_dir.display())))?;
        let known_hosts = state_dir.join("known_hosts");
        std::fs::write(&known_hosts, host_key.known_hosts_line(host))
            .map_err(|e| DriverError::ssh(host, format!("writing {}: {e}", known_hosts.display())))?;

        info!(host, fingerprint = %host_key.fingerprint(), "pinned host key");

        Ok(Self {
            host: host.to_string(),
            user: user.to_string(),
            host_key,
            known_hosts,
            auth,
            retry,
            clock,
        })
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password).args([
                    "-e",
                    "ssh",
                    "-o",
                    "PreferredAuthentications=password,keyboard-interactive",
                    "-o",
                    "PubkeyAuthentication=no",
                ]);
                cmd
            }
            SshAuth::Key(path) => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-i")
                    .arg(path)
                    .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.arg("-o")
            .arg(format!("UserKnownHostsFile={}", self.known_hosts.display()))
            .args([
                "-o",
                "StrictHostKeyChecking=yes",
                "-o",
                &format!("HostKeyAlgorithms={}", self.host_key.key_type),
                "-o",
                "ConnectTimeout=10",
                "-o",
                "LogLevel=ERROR",
                "-p",
                &SSH_PORT.to_string(),
                &format!("{}@{}", self.user, self.host),
                remote,
            ]);
        cmd
    }
}

impl RemoteShell for OpenSshShell {
    fn host(&self) -> &str {
        &self.host
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn set_auth(&mut self, auth: SshAuth) {
        self.auth = auth;
    }

    fn wait_until_reachable(&mut self) -> Result<()> {
        let mut attempt = 1;
        loop {
            debug!(host = %self.host, attempt, "attempting to reach ssh server");
            let last_error = match self.run("true", None) {
                Ok(out) if out.success() => {
                    info!(host = %self.host, "host public key verification succeeded");
                    return Ok(());
                }
                Ok(out) => out.stderr.trim().to_string(),
                Err(e) => e.to_string(),
            };
            warn!(host = %self.host, attempt, error = %last_error, "failed to reach ssh server");

            if attempt >= self.retry.attempts {
                return Err(DriverError::ssh(
                    &self.host,
                    format!("not reachable after {attempt} attempts: {last_error}"),
                ));
            }
            self.clock.sleep(self.retry.delay);
            attempt += 1;
        }
    }

    fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RemoteOutput> {
        let mut cmd = self.command(command);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::ssh(&self.host, format!("spawning ssh: {e}")))?;

        if let Some(input) = stdin {
            feed_stdin(&mut child, input).map_err(|e| {
                DriverError::ssh(&self.host, format!("writing to remote stdin: {e}"))
            })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| DriverError::ssh(&self.host, format!("waiting for ssh: {e}")))?;

        // ssh reports its own failures (including a dropped session) as 255
        let exit = match output.status.code() {
            Some(255) | None => ExitStatus::Missing,
            Some(code) => ExitStatus::Code(code),
        };

        Ok(RemoteOutput {
            exit,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn generate_key_pair(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DriverError::ssh(&self.host, format!("creating {}: {e}", parent.display()))
            })?;
        }
        remove_stale_keys(path).map_err(|e| DriverError::ssh(&self.host, e))?;

        let output = Command::new("ssh-keygen")
            .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-f"])
            .arg(path)
            .output()
            .map_err(|e| DriverError::ssh(&self.host, format!("running ssh-keygen: {e}")))?;

        if !output.status.success() {
            return Err(DriverError::ssh(
                &self.host,
                format!(
                    "ssh-keygen failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        info!(path = %path.display(), "SSH key pair generated");
        Ok(())
    }
}
