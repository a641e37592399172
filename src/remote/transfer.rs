use super::executor::{SshExecutor, SshOptions};
use super::path::shell_quote;
use super::types::TransferEvent;
use crate::error::{RemoteError, RemoteResult};
use crate::models::ConnectionParams;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

pub type ProgressSender = mpsc::Sender<TransferEvent>;

/// Copies files and directory trees between the local machine and the host.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Place `local_path` at exactly `remote_path`.
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: &ProgressSender,
    ) -> RemoteResult<()>;

    async fn download(
        &self,
        remote_path: &str,
        local_dest: &Path,
        is_dir: bool,
        progress: &ProgressSender,
    ) -> RemoteResult<()>;
}

/// rsync over the same ssh transport the executor uses.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    params: ConnectionParams,
    options: SshOptions,
    skip_compress: Vec<String>,
}

impl RsyncTransfer {
    pub fn new(params: ConnectionParams, options: SshOptions, skip_compress: Vec<String>) -> Self {
        Self {
            params,
            options,
            skip_compress,
        }
    }

    fn remote_shell(&self) -> String {
        let mut parts = vec![self.options.binary.clone()];
        for arg in SshExecutor::transport_args(&self.params, &self.options) {
            if arg.contains(char::is_whitespace) {
                parts.push(shell_quote(&arg));
            } else {
                parts.push(arg);
            }
        }
        parts.join(" ")
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-a".to_string(), "--info=progress2".to_string()];
        if !self.skip_compress.is_empty() {
            args.push(format!("--skip-compress={}", self.skip_compress.join("/")));
        }
        args.push("-e".to_string());
        args.push(self.remote_shell());
        args
    }

    fn remote_target(&self, path: &str) -> String {
        format!("{}:{}", self.params.destination(), path)
    }

    async fn run_rsync(
        &self,
        item: &str,
        source: String,
        dest: String,
        progress: &ProgressSender,
    ) -> RemoteResult<()> {
        tracing::info!("rsync {} -> {}", source, dest);

        let mut child = Command::new("rsync")
            .args(self.base_args())
            .arg(&source)
            .arg(&dest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::spawn("rsync", e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let forward_progress = async {
            let Some(stdout) = stdout else { return };
            // --info=progress2 rewrites its line with \r
            let mut chunks = BufReader::new(stdout).split(b'\r');
            while let Ok(Some(chunk)) = chunks.next_segment().await {
                let text = String::from_utf8_lossy(&chunk);
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    let _ = progress.try_send(TransferEvent::Progress {
                        item: item.to_string(),
                        text: line.to_string(),
                    });
                }
            }
        };
        let collect_stderr = async {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        };

        let ((), stderr_text) = tokio::join!(forward_progress, collect_stderr);
        let status = child
            .wait()
            .await
            .map_err(|e| RemoteError::spawn("rsync", e))?;

        if status.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                path: item.to_string(),
                message: stderr_text.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl TransferClient for RsyncTransfer {
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: &ProgressSender,
    ) -> RemoteResult<()> {
        let item = local_path.display().to_string();
        if !local_path.exists() {
            return Err(RemoteError::Transfer {
                path: item,
                message: format!("Not found: {}", local_path.display()),
            });
        }

        // A trailing slash copies the directory's contents into `remote_path`,
        // so the tree lands under its resolved final name.
        let source = if local_path.is_dir() {
            format!("{}/", item.trim_end_matches('/'))
        } else {
            item.clone()
        };
        let dest = self.remote_target(remote_path.trim_end_matches('/'));
        self.run_rsync(&item, source, dest, progress).await
    }

    async fn download(
        &self,
        remote_path: &str,
        local_dest: &Path,
        is_dir: bool,
        progress: &ProgressSender,
    ) -> RemoteResult<()> {
        if let Some(parent) = local_dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::Transfer {
                    path: local_dest.display().to_string(),
                    message: e.to_string(),
                })?;
        }

        let source = if is_dir {
            self.remote_target(&format!("{}/", remote_path.trim_end_matches('/')))
        } else {
            self.remote_target(remote_path)
        };
        let dest = local_dest.display().to_string();
        self.run_rsync(remote_path, source, dest, progress).await
    }
}
