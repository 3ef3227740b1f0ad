//! Remote shell access to job instances
//!
//! Each job gets a host entry `cloudexec-{id}` in `~/.ssh/config.d/`, pulled in
//! by an `Include config.d/*` line in `~/.ssh/config`, so plain
//! `ssh cloudexec-{id}` works from any terminal.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

const INCLUDE_LINE: &str = "Include config.d/*\n";
const MARKER_LINE: &str = "# Added by cloudexec\n";
const KEY_FILE: &str = "cloudexec-key";
const REMOTE_LOG: &str = "/var/log/cloud-init-output.log";
const TMUX_SESSION: &str = "cloudexec";

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Public half of the key pair used for every instance, created on first use
    async fn ensure_key_pair(&self) -> Result<String>;

    async fn register_host(&self, job_id: i64, ip: &str) -> Result<()>;

    /// Drop the host entry of a job. Missing entries are ignored.
    async fn forget_host(&self, job_id: i64) -> Result<()>;

    async fn wait_until_reachable(&self, job_id: i64) -> Result<()>;

    /// Follow the instance's cloud-init log until interrupted
    async fn stream_logs(&self, job_id: i64) -> Result<()>;

    /// Attach the terminal to the job's tmux session
    async fn attach(&self, job_id: i64) -> Result<()>;
}

pub fn host_alias(job_id: i64) -> String {
    format!("cloudexec-{}", job_id)
}

/// `ssh` / `ssh-keygen` driven shell
pub struct OpenSshShell {
    ssh_dir: PathBuf,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl OpenSshShell {
    pub fn new(ssh_dir: impl Into<PathBuf>) -> Self {
        Self {
            ssh_dir: ssh_dir.into(),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(60),
        }
    }

    /// Shell rooted at `~/.ssh`
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| OrchestratorError::shell("cannot determine home directory"))?;
        Ok(Self::new(home.join(".ssh")))
    }

    pub fn with_probe(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.ssh_dir.join(KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.ssh_dir.join(format!("{}.pub", KEY_FILE))
    }

    pub fn host_file(&self, job_id: i64) -> PathBuf {
        self.ssh_dir.join("config.d").join(host_alias(job_id))
    }

    /// Host entry written for a job
    pub fn render_host_entry(&self, job_id: i64, ip: &str) -> String {
        format!(
            "{marker}Host {alias}\n  HostName {ip}\n  User root\n  IdentityFile {key}\n  IdentitiesOnly yes\n  ForwardAgent yes\n  StrictHostKeyChecking no\n  UserKnownHostsFile=/dev/null\n  GlobalKnownHostsFile=/dev/null\n  Port 22\n",
            marker = MARKER_LINE,
            alias = host_alias(job_id),
            ip = ip,
            key = self.private_key_path().display(),
        )
    }

    /// Make `~/.ssh/config` include the per-job host files
    pub async fn ensure_include(&self) -> Result<()> {
        create_private_dir(&self.ssh_dir).await?;
        let config_path = self.ssh_dir.join("config");

        let existing = match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if existing.contains(INCLUDE_LINE) {
            return Ok(());
        }

        // Include must come before any Host block to apply globally
        let updated = format!("{}{}{}", MARKER_LINE, INCLUDE_LINE, existing);
        write_private(&config_path, updated.as_bytes()).await?;
        debug!(path = %config_path.display(), "Added config.d include to SSH config");
        Ok(())
    }

    fn ssh(&self, job_id: i64) -> Command {
        let mut command = Command::new("ssh");
        command.arg("-F").arg(self.host_file(job_id));
        command
    }

    async fn probe(&self, job_id: i64) -> Result<bool> {
        let status = self
            .ssh(job_id)
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={}", self.probe_interval.as_secs().max(1)))
            .arg(host_alias(job_id))
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| OrchestratorError::shell(format!("failed to run ssh: {}", e)))?;
        Ok(status.success())
    }

    async fn run_interactive(&self, mut command: Command, what: &str) -> Result<()> {
        let status = command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| OrchestratorError::shell(format!("failed to run ssh: {}", e)))?;
        if !status.success() {
            return Err(OrchestratorError::shell(format!("{} failed: {}", what, status)));
        }
        Ok(())
    }
}

async fn create_private_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn ensure_key_pair(&self) -> Result<String> {
        self.ensure_include().await?;
        let private_key = self.private_key_path();
        let public_key = self.public_key_path();

        if tokio::fs::try_exists(&private_key).await? {
            return Ok(tokio::fs::read_to_string(&public_key).await?);
        }

        info!(path = %private_key.display(), "Creating new SSH key pair");
        let output = Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "cloudexec", "-f"])
            .arg(&private_key)
            .output()
            .await
            .map_err(|e| OrchestratorError::shell(format!("failed to run ssh-keygen: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::shell(format!(
                "ssh-keygen failed: {}",
                stderr.trim()
            )));
        }

        Ok(tokio::fs::read_to_string(&public_key).await?)
    }

    async fn register_host(&self, job_id: i64, ip: &str) -> Result<()> {
        self.ensure_include().await?;
        let host_file = self.host_file(job_id);
        if let Some(dir) = host_file.parent() {
            create_private_dir(dir).await?;
        }
        write_private(&host_file, self.render_host_entry(job_id, ip).as_bytes()).await?;
        info!(job_id, ip, host = %host_alias(job_id), "SSH host entry added");
        Ok(())
    }

    async fn forget_host(&self, job_id: i64) -> Result<()> {
        match tokio::fs::remove_file(self.host_file(job_id)).await {
            Ok(()) => {
                info!(job_id, "SSH host entry removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_until_reachable(&self, job_id: i64) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            if self.probe(job_id).await? {
                info!(job_id, "SSH connection established");
                return Ok(());
            }
            if started.elapsed() >= self.probe_timeout {
                return Err(OrchestratorError::shell(format!(
                    "timed out waiting for SSH on {} after {:?}",
                    host_alias(job_id),
                    self.probe_timeout
                )));
            }
            warn!(job_id, "SSH not reachable yet");
            tokio::time::sleep(self.probe_interval).await;
        }
    }

    async fn stream_logs(&self, job_id: i64) -> Result<()> {
        let mut command = self.ssh(job_id);
        command.arg(host_alias(job_id)).args(["tail", "-f", REMOTE_LOG]);
        self.run_interactive(command, "Streaming logs").await
    }

    async fn attach(&self, job_id: i64) -> Result<()> {
        let mut command = self.ssh(job_id);
        command
            .arg("-t")
            .arg(host_alias(job_id))
            .args(["tmux", "attach-session", "-t", TMUX_SESSION]);
        self.run_interactive(command, "Attaching to tmux session").await
    }
}
