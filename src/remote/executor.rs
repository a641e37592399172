use crate::error::{RemoteError, RemoteResult};
use crate::models::ConnectionParams;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Runs one shell command on the remote host and returns its stdout.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, command: &str) -> RemoteResult<String>;
}

/// Options shared by every ssh invocation for one connection.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub binary: String,
    pub timeout: Duration,
    /// Directory holding the multiplexing sockets, one per destination
    pub control_dir: PathBuf,
    pub control_persist_secs: u64,
}

impl SshOptions {
    pub fn new(binary: &str, timeout: Duration, control_persist_secs: u64) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
            control_dir: std::env::temp_dir(),
            control_persist_secs,
        }
    }
}

/// Executes commands through the system ssh client, reusing one master
/// connection per process via `ControlMaster`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    params: ConnectionParams,
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(params: ConnectionParams, options: SshOptions) -> Self {
        Self { params, options }
    }

    /// Master socket for `params`, distinct per user, host and port.
    pub fn control_path(params: &ConnectionParams, options: &SshOptions) -> PathBuf {
        let name: String = format!("sshdrop-{}@{}-{}", params.user, params.hostname, params.port)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        options.control_dir.join(name)
    }

    /// Arguments placed before the destination, also used as rsync's `-e` shell.
    pub fn transport_args(params: &ConnectionParams, options: &SshOptions) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            params.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", Self::control_path(params, options).display()),
            "-o".to_string(),
            format!("ControlPersist={}", options.control_persist_secs),
        ];
        if let Some(identity) = &params.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, command: &str) -> RemoteResult<String> {
        tracing::debug!("ssh {} $ {}", self.params.destination(), command);

        let mut cmd = Command::new(&self.options.binary);
        cmd.args(Self::transport_args(&self.params, &self.options))
            .arg(self.params.destination())
            .arg(command)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.options.timeout, cmd.output())
            .await
            .map_err(|_| RemoteError::Timeout(self.options.timeout))?
            .map_err(|e| RemoteError::spawn(&self.options.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!("Remote command exited with {}: {}", output.status, stderr.trim());
            return Err(RemoteError::Transport(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
