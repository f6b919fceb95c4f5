//! Remote command execution against provisioned hosts.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors raised by the remote command channel.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The channel could not be opened (refused, auth, unreachable).
    #[error("Connection to {host} failed: {message}")]
    Connect { host: String, message: String },

    /// The command did not finish within its timeout.
    #[error("Command on {host} timed out after {timeout_secs} seconds")]
    Timeout { host: String, timeout_secs: u64 },

    /// The local client process could not be started.
    #[error("Failed to spawn remote client: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code of the remote command.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for running commands on a remote host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host`, bounded by `timeout`.
    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;
}

/// Exit code the `ssh` client uses for its own (connection) failures.
const SSH_CLIENT_ERROR: i32 = 255;

/// [`RemoteExecutor`] backed by the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// Login user.
    user: String,
    /// Private key path.
    key_path: Option<PathBuf>,
    /// TCP connect timeout.
    connect_timeout: Duration,
}

impl SshExecutor {
    /// Create a new SSH executor.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key_path: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the private key used for authentication.
    #[must_use]
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the `ssh` argument list for a command.
    fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        for opt in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "BatchMode=yes".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".to_string());
            args.push(opt);
        }
        args.push(format!("{}@{}", self.user, host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, timeout_secs = timeout.as_secs(), "Running remote command");

        let child = Command::new("ssh")
            .args(self.ssh_args(host, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                host: host.to_string(),
                timeout_secs: timeout.as_secs(),
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code == SSH_CLIENT_ERROR {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args_with_key() {
        let ssh = SshExecutor::new("ubuntu")
            .with_key("/keys/id_ed25519")
            .with_connect_timeout(Duration::from_secs(7));
        let args = ssh.ssh_args("10.0.0.5", "echo ok");

        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "/keys/id_ed25519");
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args[args.len() - 2], "ubuntu@10.0.0.5");
        assert_eq!(args[args.len() - 1], "echo ok");
    }

    #[test]
    fn test_ssh_args_without_key() {
        let args = SshExecutor::new("ec2-user").ssh_args("host", "true");
        assert_ne!(args[0], "-i");
    }

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput::default();
        assert!(ok.success());
        let failed = CommandOutput {
            exit_code: 1,
            ..CommandOutput::default()
        };
        assert!(!failed.success());
    }
}
