//! Docker CLI adapter.
//!
//! Talks to the local Docker daemon through the `docker` binary. Command
//! lines come from the pure builders in [`crate::args`]; JSON interrogation
//! goes through `docker inspect` and friends.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use k3c_types::NodeSpec;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::args;
use crate::cli;
use crate::error::{Result, RuntimeError};
use crate::info::{
    ContainerInfo, ExecResult, NetworkAttachment, NetworkInfo, NetworkMember, RuntimeHostInfo,
    RuntimeKind, VolumeInfo,
};
use crate::ipam::IpamPool;
use crate::{LabelFilters, Runtime};

/// Environment variable overriding the docker binary path.
const DOCKER_BIN_ENV: &str = "K3C_DOCKER_BIN";

/// Runtime adapter backed by the `docker` CLI.
pub struct DockerCli {
    binary: String,
    ipam: IpamPool,
}

impl DockerCli {
    /// Creates an adapter using `docker` from `PATH`, or the binary named
    /// by `K3C_DOCKER_BIN`.
    #[must_use]
    pub fn new() -> Self {
        let binary = std::env::var(DOCKER_BIN_ENV).unwrap_or_else(|_| "docker".to_string());
        Self {
            binary,
            ipam: IpamPool::default(),
        }
    }

    async fn run(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<String> {
        cli::run(&self.binary, &args, cancel).await
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for DockerCli {
    fn id(&self) -> &'static str {
        "docker"
    }

    async fn container_create(
        &self,
        spec: &NodeSpec,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let stdout = self.run(args::create_args(spec), cancel).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::MalformedOutput {
                command: "docker create".to_string(),
                message: "no container id returned".to_string(),
            });
        }

        // The container was created on its first network; attach the rest
        // in declared order.
        for network in spec.networks.iter().skip(1) {
            self.network_connect(&spec.name, network, None, cancel)
                .await?;
        }

        debug!(container = %spec.name, %id, "created");
        Ok(id)
    }

    async fn container_start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(args::start_args(name), cancel).await.map(|_| ())
    }

    async fn container_stop(
        &self,
        name: &str,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(args::stop_args(name, grace.as_secs()), cancel)
            .await
            .map(|_| ())
    }

    async fn container_delete(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(args::rm_args(name, force), cancel).await.map(|_| ())
    }

    async fn container_inspect(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInfo> {
        let stdout = self.run(args::inspect_args(name), cancel).await?;
        let mut parsed: Vec<InspectContainer> = parse_json("docker inspect", &stdout)?;
        let raw = parsed
            .pop()
            .ok_or_else(|| RuntimeError::not_found(format!("container {name}")))?;
        Ok(raw.into())
    }

    async fn container_list(
        &self,
        filters: &LabelFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerInfo>> {
        let stdout = self.run(args::ps_args(filters), cancel).await?;
        let mut containers = Vec::new();
        for name in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            containers.push(self.container_inspect(name, cancel).await?);
        }
        Ok(containers)
    }

    async fn container_rename(
        &self,
        name: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(args::rename_args(name, new_name), cancel)
            .await
            .map(|_| ())
    }

    async fn copy_to_container(
        &self,
        name: &str,
        dest: &str,
        content: &[u8],
        mode: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        // Stage the destination path inside a temp dir and copy the tree
        // onto the container root, so intermediate directories come into
        // existence even on created-but-not-started containers.
        let staging = tempfile::tempdir()?;
        let relative = dest.trim_start_matches('/');
        let staged = staging.path().join(relative);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&staged, content)?;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(mode))?;

        let src = format!("{}/.", staging.path().display());
        self.run(args::cp_to_args(&src, name, "/"), cancel)
            .await
            .map(|_| ())
    }

    async fn copy_from_container(
        &self,
        name: &str,
        src: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let staging = tempfile::tempdir()?;
        let dest = staging.path().join("out");
        let dest_str = dest.to_string_lossy().to_string();
        self.run(args::cp_from_args(name, src, &dest_str), cancel)
            .await?;
        Ok(std::fs::read(&dest)?)
    }

    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        let (exit_code, stdout, stderr) =
            cli::run_unchecked(&self.binary, &args::exec_args(name, cmd), cancel).await?;
        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn exec_streaming(
        &self,
        name: &str,
        cmd: &[String],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        cli::run_streaming(&self.binary, &args::exec_args(name, cmd), cancel).await
    }

    async fn read_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let since = since.map(|t| t.to_rfc3339());
        let (code, stdout, stderr) = cli::run_unchecked(
            &self.binary,
            &args::logs_args(name, since.as_deref()),
            cancel,
        )
        .await?;
        if code != 0 {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker logs {name}"),
                status: code,
                stderr,
            });
        }
        // docker logs multiplexes container stderr onto our stderr
        Ok(stdout + &stderr)
    }

    async fn network_create_if_absent(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(NetworkInfo, bool)> {
        match self.network_get(name, cancel).await {
            Ok(info) => return Ok((info, false)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        match self.run(args::network_create_args(name, labels), cancel).await {
            Ok(_) => {}
            // lost a race against a concurrent creator; adopt theirs
            Err(err) if err.is_already_exists() => {
                return Ok((self.network_get(name, cancel).await?, false));
            }
            Err(err) => return Err(err),
        }

        Ok((self.network_get(name, cancel).await?, true))
    }

    async fn network_connect(
        &self,
        container: &str,
        network: &str,
        ip: Option<IpAddr>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ip = ip.map(|ip| ip.to_string());
        self.run(
            args::network_connect_args(container, network, ip.as_deref()),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn network_disconnect(
        &self,
        container: &str,
        network: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(args::network_disconnect_args(container, network), cancel)
            .await
            .map(|_| ())
    }

    async fn network_delete(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(args::network_rm_args(name), cancel).await.map(|_| ())
    }

    async fn network_get(&self, name: &str, cancel: &CancellationToken) -> Result<NetworkInfo> {
        let stdout = self.run(args::network_inspect_args(name), cancel).await?;
        let mut parsed: Vec<InspectNetwork> = parse_json("docker network inspect", &stdout)?;
        let raw = parsed
            .pop()
            .ok_or_else(|| RuntimeError::not_found(format!("network {name}")))?;
        Ok(raw.into())
    }

    async fn network_list(
        &self,
        filters: &LabelFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<NetworkInfo>> {
        let stdout = self.run(args::network_ls_args(filters), cancel).await?;
        let mut networks = Vec::new();
        for name in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            networks.push(self.network_get(name, cancel).await?);
        }
        Ok(networks)
    }

    async fn allocate_ip(&self, network: &str, cancel: &CancellationToken) -> Result<IpAddr> {
        let info = self.network_get(network, cancel).await?;
        let subnet: IpNetwork = info
            .subnet
            .as_deref()
            .ok_or_else(|| RuntimeError::MalformedOutput {
                command: "docker network inspect".to_string(),
                message: format!("network {network} has no subnet"),
            })?
            .parse()
            .map_err(|e| RuntimeError::MalformedOutput {
                command: "docker network inspect".to_string(),
                message: format!("bad subnet on network {network}: {e}"),
            })?;
        let gateway = info.gateway.as_deref().and_then(|g| g.parse().ok());

        let live_used: HashSet<IpAddr> = info
            .containers
            .iter()
            .filter_map(|m| m.ip.as_deref())
            .filter_map(|ip| ip.parse().ok())
            .collect();

        self.ipam.allocate(network, &subnet, gateway, &live_used).await
    }

    async fn release_ip(
        &self,
        network: &str,
        ip: IpAddr,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.ipam.release(network, ip).await;
        Ok(())
    }

    async fn volume_create(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(args::volume_create_args(name, labels), cancel)
            .await
            .map(|_| ())
    }

    async fn volume_delete(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(args::volume_rm_args(name), cancel).await.map(|_| ())
    }

    async fn volume_get(&self, name: &str, cancel: &CancellationToken) -> Result<VolumeInfo> {
        let stdout = self.run(args::volume_inspect_args(name), cancel).await?;
        let mut parsed: Vec<InspectVolume> = parse_json("docker volume inspect", &stdout)?;
        let raw = parsed
            .pop()
            .ok_or_else(|| RuntimeError::not_found(format!("volume {name}")))?;
        Ok(VolumeInfo {
            name: raw.name,
            labels: raw.labels,
        })
    }

    async fn volume_list(
        &self,
        filters: &LabelFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<VolumeInfo>> {
        let stdout = self.run(args::volume_ls_args(filters), cancel).await?;
        let mut volumes = Vec::new();
        for name in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            volumes.push(self.volume_get(name, cancel).await?);
        }
        Ok(volumes)
    }

    async fn image_exists(&self, reference: &str, cancel: &CancellationToken) -> Result<bool> {
        match self.run(args::image_inspect_args(reference), cancel).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn image_pull(&self, reference: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(args::pull_args(reference), cancel).await.map(|_| ())
    }

    async fn image_save(
        &self,
        references: &[String],
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dest = dest.to_string_lossy().to_string();
        self.run(args::save_args(references, &dest), cancel)
            .await
            .map(|_| ())
    }

    async fn image_load(&self, tar: &Path, cancel: &CancellationToken) -> Result<()> {
        let tar = tar.to_string_lossy().to_string();
        self.run(args::load_args(&tar), cancel).await.map(|_| ())
    }

    async fn host_info(&self, cancel: &CancellationToken) -> Result<RuntimeHostInfo> {
        let stdout = self.run(args::info_args(), cancel).await?;
        let raw: InspectInfo = parse_json("docker info", stdout.trim())?;
        let os = raw.operating_system.unwrap_or_default();
        let kind = if os.contains("Docker Desktop") || os.contains("Rancher Desktop") {
            RuntimeKind::VmBacked
        } else {
            RuntimeKind::Native
        };
        Ok(RuntimeHostInfo {
            kind,
            os,
            cgroup_v2: raw.cgroup_version.as_deref() == Some("2"),
        })
    }

    async fn host_gateway_ip(
        &self,
        network: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IpAddr>> {
        let info = self.network_get(network, cancel).await?;
        Ok(info.gateway.as_deref().and_then(|g| g.parse().ok()))
    }
}

fn parse_json<'a, T: Deserialize<'a>>(command: &str, raw: &'a str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| RuntimeError::MalformedOutput {
        command: command.to_string(),
        message: e.to_string(),
    })
}

// --- docker inspect wire types ---

#[derive(Debug, Deserialize)]
struct InspectContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Mounts", default)]
    mounts: Vec<InspectMount>,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InspectMount {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Source")]
    source: Option<String>,
    #[serde(rename = "Destination")]
    destination: String,
    #[serde(rename = "RW")]
    rw: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "StartedAt")]
    started_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, InspectEndpoint>,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
}

impl From<InspectContainer> for ContainerInfo {
    fn from(raw: InspectContainer) -> Self {
        let started_at = raw
            .state
            .started_at
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            // docker reports year 1 for containers that never started
            .filter(|t| t.timestamp() > 0);

        let networks = raw
            .network_settings
            .networks
            .into_iter()
            .map(|(network, ep)| NetworkAttachment {
                network,
                ip: ep.ip_address.filter(|ip| !ip.is_empty()),
            })
            .collect();

        let env = raw
            .config
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        // named volumes report their name, bind mounts their host path
        let mounts = raw
            .mounts
            .into_iter()
            .filter_map(|m| {
                let source = m.name.or(m.source)?;
                Some(k3c_types::VolumeMount {
                    source,
                    target: m.destination,
                    read_only: !m.rw.unwrap_or(true),
                })
            })
            .collect();

        Self {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            image: raw.config.image,
            labels: raw.config.labels,
            cmd: raw.config.cmd.unwrap_or_default(),
            env,
            mounts,
            state: raw.state.status,
            running: raw.state.running,
            started_at,
            networks,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "IPAM", default)]
    ipam: InspectIpam,
    #[serde(rename = "Containers", default)]
    containers: BTreeMap<String, InspectNetworkContainer>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectIpam {
    #[serde(rename = "Config", default)]
    config: Vec<InspectIpamConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectIpamConfig {
    #[serde(rename = "Subnet")]
    subnet: Option<String>,
    #[serde(rename = "Gateway")]
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InspectNetworkContainer {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IPv4Address")]
    ipv4_address: Option<String>,
}

impl From<InspectNetwork> for NetworkInfo {
    fn from(raw: InspectNetwork) -> Self {
        let (subnet, gateway) = raw
            .ipam
            .config
            .first()
            .map(|c| (c.subnet.clone(), c.gateway.clone()))
            .unwrap_or((None, None));

        let containers = raw
            .containers
            .into_values()
            .map(|c| NetworkMember {
                name: c.name,
                // addresses come CIDR-suffixed from the daemon
                ip: c
                    .ipv4_address
                    .and_then(|a| a.split('/').next().map(str::to_string))
                    .filter(|a| !a.is_empty()),
            })
            .collect();

        Self {
            id: raw.id,
            name: raw.name,
            labels: raw.labels,
            subnet,
            gateway,
            containers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectVolume {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InspectInfo {
    #[serde(rename = "OperatingSystem")]
    operating_system: Option<String>,
    #[serde(rename = "CgroupVersion")]
    cgroup_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_inspect_parse() {
        let raw = r#"[{
            "Id": "abc123",
            "Name": "/k3c-dev-server-0",
            "Config": {
                "Image": "rancher/k3s:v1.31.5-k3s1",
                "Labels": {"app": "k3c", "k3c.cluster": "dev"},
                "Cmd": ["server", "--cluster-init"],
                "Env": ["K3S_TOKEN=secret", "PATH=/usr/bin"]
            },
            "State": {
                "Status": "running",
                "Running": true,
                "StartedAt": "2026-03-01T10:00:00.5Z"
            },
            "Mounts": [
                {"Type": "volume", "Name": "k3c-dev-images", "Destination": "/k3c/images", "RW": true},
                {"Type": "bind", "Source": "/data", "Destination": "/var/lib/storage", "RW": false}
            ],
            "NetworkSettings": {
                "Networks": {
                    "k3c-dev": {"IPAddress": "172.28.0.2"}
                }
            }
        }]"#;
        let parsed: Vec<InspectContainer> = serde_json::from_str(raw).unwrap();
        let info: ContainerInfo = parsed.into_iter().next().unwrap().into();

        assert_eq!(info.name, "k3c-dev-server-0");
        assert!(info.running);
        assert!(info.started_at.is_some());
        assert_eq!(info.labels.get("k3c.cluster").unwrap(), "dev");
        assert_eq!(info.cmd, vec!["server", "--cluster-init"]);
        assert_eq!(info.env.get("K3S_TOKEN").map(String::as_str), Some("secret"));
        assert_eq!(info.mounts.len(), 2);
        assert_eq!(info.mounts[0].source, "k3c-dev-images");
        assert_eq!(info.mounts[0].target, "/k3c/images");
        assert!(!info.mounts[0].read_only);
        assert_eq!(info.mounts[1].source, "/data");
        assert!(info.mounts[1].read_only);
        assert_eq!(info.ip_on("k3c-dev"), Some("172.28.0.2"));
        assert_eq!(info.ip_on("other"), None);
    }

    #[test]
    fn test_container_inspect_never_started() {
        let raw = r#"[{
            "Id": "abc",
            "Name": "/x",
            "Config": {"Image": "img", "Labels": {}},
            "State": {"Status": "created", "Running": false, "StartedAt": "0001-01-01T00:00:00Z"},
            "NetworkSettings": {"Networks": {}}
        }]"#;
        let parsed: Vec<InspectContainer> = serde_json::from_str(raw).unwrap();
        let info: ContainerInfo = parsed.into_iter().next().unwrap().into();
        assert!(info.started_at.is_none());
        assert!(!info.running);
        assert!(info.cmd.is_empty());
        assert!(info.env.is_empty());
        assert!(info.mounts.is_empty());
    }

    #[test]
    fn test_network_inspect_parse() {
        let raw = r#"[{
            "Id": "net1",
            "Name": "k3c-dev",
            "Labels": {"app": "k3c"},
            "IPAM": {"Config": [{"Subnet": "172.28.0.0/16", "Gateway": "172.28.0.1"}]},
            "Containers": {
                "abc": {"Name": "k3c-dev-server-0", "IPv4Address": "172.28.0.2/16"}
            }
        }]"#;
        let parsed: Vec<InspectNetwork> = serde_json::from_str(raw).unwrap();
        let info: NetworkInfo = parsed.into_iter().next().unwrap().into();

        assert_eq!(info.subnet.as_deref(), Some("172.28.0.0/16"));
        assert_eq!(info.gateway.as_deref(), Some("172.28.0.1"));
        assert_eq!(info.containers.len(), 1);
        assert_eq!(info.containers[0].ip.as_deref(), Some("172.28.0.2"));
    }

    #[test]
    fn test_info_parse_vm_backed() {
        let raw = r#"{"OperatingSystem": "Docker Desktop", "CgroupVersion": "2"}"#;
        let parsed: InspectInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.operating_system.as_deref(), Some("Docker Desktop"));
        assert_eq!(parsed.cgroup_version.as_deref(), Some("2"));
    }
}
