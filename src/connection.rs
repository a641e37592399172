//! Resolves an ssh config host alias into connection parameters.

use crate::models::{ConnectionParams, SshHost};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Looks up the externally visible port for a container port.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn mapped_port(&self, hostname: &str, container_port: u16) -> Option<u16>;
}

/// Outcome of resolving one alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub alias: String,
    pub params: ConnectionParams,
    /// Port from the ssh config when a mapping replaced it
    pub remapped_from: Option<u16>,
}

pub struct ConnectionResolver {
    ssh_config_path: PathBuf,
    excluded_prefixes: Vec<String>,
    remap_container_port: Option<u16>,
    mapper: Arc<dyn PortMapper>,
}

impl ConnectionResolver {
    pub fn new(
        ssh_config_path: impl Into<PathBuf>,
        excluded_prefixes: Vec<String>,
        remap_container_port: Option<u16>,
        mapper: Arc<dyn PortMapper>,
    ) -> Self {
        Self {
            ssh_config_path: ssh_config_path.into(),
            excluded_prefixes,
            remap_container_port,
            mapper,
        }
    }

    /// Host aliases in file order, without wildcard patterns or excluded prefixes.
    pub fn list_hosts(&self) -> Result<Vec<String>> {
        if !self.ssh_config_path.exists() {
            tracing::warn!("SSH config file not found at {:?}", self.ssh_config_path);
            return Ok(Vec::new());
        }
        let hosts = parse_ssh_config(&self.read_config()?)
            .into_iter()
            .map(|h| h.alias)
            .filter(|alias| {
                !self
                    .excluded_prefixes
                    .iter()
                    .any(|prefix| alias.starts_with(prefix.as_str()))
            })
            .collect();
        Ok(hosts)
    }

    pub async fn resolve(&self, alias: &str) -> Result<ResolvedHost> {
        let content = self.read_config()?;
        let host = parse_ssh_config(&content)
            .into_iter()
            .find(|h| h.alias == alias)
            .with_context(|| format!("Host '{}' not found in SSH config", alias))?;

        let mut params = ConnectionParams::from(&host);
        let mut remapped_from = None;

        if let Some(container_port) = self.remap_container_port {
            if let Some(mapped) = self.mapper.mapped_port(&params.hostname, container_port).await {
                if mapped != params.port {
                    tracing::info!(
                        "Using mapped port {} for container port {} (configured {})",
                        mapped,
                        container_port,
                        params.port
                    );
                    remapped_from = Some(params.port);
                }
                params.port = mapped;
            }
        }

        Ok(ResolvedHost {
            alias: alias.to_string(),
            params,
            remapped_from,
        })
    }

    fn read_config(&self) -> Result<String> {
        fs::read_to_string(&self.ssh_config_path)
            .with_context(|| format!("Failed to read SSH config at {:?}", self.ssh_config_path))
    }
}

/// Parse `Host` blocks. Wildcard patterns are not listed as hosts.
pub fn parse_ssh_config(content: &str) -> Vec<SshHost> {
    let mut hosts: Vec<SshHost> = Vec::new();
    // Indices into `hosts` that the current block applies to
    let mut current: Vec<usize> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match line.split_once(|c: char| c.is_whitespace() || c == '=') {
            Some((k, v)) => (k.to_lowercase(), v.trim_start_matches(['=', ' ', '\t']).trim()),
            None => continue,
        };

        if key == "host" {
            current.clear();
            for pattern in value.split_whitespace() {
                if pattern.contains(['*', '?', '!']) {
                    continue;
                }
                current.push(hosts.len());
                hosts.push(SshHost::new(
                    pattern.to_string(),
                    pattern.to_string(),
                    "root".to_string(),
                ));
            }
            continue;
        }

        for &idx in &current {
            let host = &mut hosts[idx];
            match key.as_str() {
                "hostname" => host.host = value.to_string(),
                "user" => host.user = value.to_string(),
                "port" => {
                    if let Ok(port) = value.parse::<u16>() {
                        host.port = Some(port);
                    }
                }
                "identityfile" => host.identity_file = Some(expand_tilde(value)),
                _ => {}
            }
        }
    }

    hosts
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VastInstance {
    #[serde(default)]
    pub actual_status: Option<String>,
    #[serde(default)]
    pub public_ipaddr: Option<String>,
    #[serde(default)]
    pub ports: HashMap<String, Vec<VastPort>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VastPort {
    #[serde(rename = "HostPort")]
    pub host_port: serde_json::Value,
}

impl VastPort {
    fn port(&self) -> Option<u16> {
        match &self.host_port {
            serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Pick the running instance for `hostname` (or the only running one) and
/// read the host port bound to `container_port`.
pub fn select_mapped_port(
    instances: &[VastInstance],
    hostname: &str,
    container_port: u16,
) -> Option<u16> {
    let running: Vec<&VastInstance> = instances
        .iter()
        .filter(|i| i.actual_status.as_deref() == Some("running"))
        .collect();

    let instance = running
        .iter()
        .find(|i| i.public_ipaddr.as_deref() == Some(hostname))
        .or_else(|| if running.len() == 1 { running.first() } else { None })?;

    instance
        .ports
        .get(&format!("{}/tcp", container_port))?
        .first()?
        .port()
}

/// Reads port mappings from the `vastai` CLI.
#[derive(Debug, Default, Clone)]
pub struct VastPortMapper;

#[async_trait]
impl PortMapper for VastPortMapper {
    async fn mapped_port(&self, hostname: &str, container_port: u16) -> Option<u16> {
        let output = tokio::process::Command::new("vastai")
            .args(["show", "instances", "--raw"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            tracing::debug!("vastai exited with {}", output.status);
            return None;
        }
        let instances: Vec<VastInstance> = match serde_json::from_slice(&output.stdout) {
            Ok(instances) => instances,
            Err(e) => {
                tracing::debug!("Unreadable vastai output: {}", e);
                return None;
            }
        };
        select_mapped_port(&instances, hostname, container_port)
    }
}
