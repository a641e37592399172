use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A `Host` block read from the ssh config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshHost {
    pub alias: String,
    pub host: String,
    pub user: String,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

impl SshHost {
    pub fn new(alias: String, host: String, user: String) -> Self {
        Self {
            alias,
            host,
            user,
            port: None,
            identity_file: None,
        }
    }
}

/// Effective parameters used to reach a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<PathBuf>,
}

impl ConnectionParams {
    /// `user@hostname`, the destination argument for ssh and rsync.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }
}

impl From<&SshHost> for ConnectionParams {
    fn from(host: &SshHost) -> Self {
        Self {
            hostname: host.host.clone(),
            port: host.port.unwrap_or(22),
            user: host.user.clone(),
            identity: host.identity_file.clone(),
        }
    }
}
