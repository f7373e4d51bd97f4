//! Runtime-neutral descriptions of live objects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k3c_types::VolumeMount;
use serde::{Deserialize, Serialize};

/// A container as observed on the runtime.
///
/// Carries enough of the container's configuration (command, environment,
/// mounts) that a node spec can be reconstructed from it; growing a cluster
/// clones the spec of an inspected node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Runtime-assigned ID.
    pub id: String,
    /// Container name.
    pub name: String,
    /// OCI image reference.
    pub image: String,
    /// Labels stored on the container.
    pub labels: BTreeMap<String, String>,
    /// Full command line (command plus arguments).
    pub cmd: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Volume and bind mounts.
    pub mounts: Vec<VolumeMount>,
    /// Raw state string (created, running, exited, ...).
    pub state: String,
    /// Whether the container is running.
    pub running: bool,
    /// Start timestamp, when running.
    pub started_at: Option<DateTime<Utc>>,
    /// IP address per attached network, in network attach order.
    pub networks: Vec<NetworkAttachment>,
}

impl ContainerInfo {
    /// IP on the container's first attached network.
    ///
    /// This is the address that persists in a node's observed state;
    /// additional networks are tracked but do not affect identity.
    #[must_use]
    pub fn primary_ip(&self) -> Option<&str> {
        self.networks.first().and_then(|n| n.ip.as_deref())
    }

    /// IP of the container on a specific network, if attached.
    #[must_use]
    pub fn ip_on(&self, network: &str) -> Option<&str> {
        self.networks
            .iter()
            .find(|n| n.network == network)
            .and_then(|n| n.ip.as_deref())
    }
}

/// One network attachment of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name.
    pub network: String,
    /// Assigned address, if any.
    pub ip: Option<String>,
}

/// A network as observed on the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Runtime-assigned ID.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Labels stored on the network.
    pub labels: BTreeMap<String, String>,
    /// Subnet in CIDR notation, when configured.
    pub subnet: Option<String>,
    /// Gateway address, when configured.
    pub gateway: Option<String>,
    /// Containers attached to the network, with their addresses.
    pub containers: Vec<NetworkMember>,
}

/// One container attached to a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMember {
    pub name: String,
    pub ip: Option<String>,
}

/// A volume as observed on the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Labels stored on the volume.
    pub labels: BTreeMap<String, String>,
}

/// Result of a one-shot exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true when the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What kind of daemon we are talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Daemon runs directly on the host kernel.
    Native,
    /// Daemon runs inside a utility VM (e.g. Docker Desktop); the host is
    /// not directly reachable from container networks.
    VmBacked,
}

/// Host-level facts about the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeHostInfo {
    /// Native or VM-backed.
    pub kind: RuntimeKind,
    /// Operating system string reported by the daemon.
    pub os: String,
    /// Whether the host runs cgroup v2.
    pub cgroup_v2: bool,
}
