//! Node model: the atomic unit of a cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Role of a node within a cluster.
///
/// The role determines image, arguments, lifecycle hooks, readiness
/// criterion and required labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// k3s server (control plane).
    Server,
    /// k3s agent (worker).
    Agent,
    /// Reverse proxy fronting the server API.
    LoadBalancer,
    /// OCI image registry.
    Registry,
    /// Ephemeral helper container.
    Tools,
}

impl Role {
    /// Returns the role name used in labels and object names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Agent => "agent",
            Self::LoadBalancer => "loadbalancer",
            Self::Registry => "registry",
            Self::Tools => "tools",
        }
    }

    /// Returns true for roles that run the k3s binary.
    #[must_use]
    pub const fn is_k3s(&self) -> bool {
        matches!(self, Self::Server | Self::Agent)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "agent" => Ok(Self::Agent),
            "loadbalancer" => Ok(Self::LoadBalancer),
            "registry" => Ok(Self::Registry),
            "tools" => Ok(Self::Tools),
            other => Err(TypesError::UnknownRole(other.to_string())),
        }
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Host-to-container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind, if restricted.
    pub host_ip: Option<String>,
    /// Host port; `None` lets the runtime pick a free one.
    pub host_port: Option<u16>,
    /// Port inside the container.
    pub container_port: u16,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// Maps a host port straight onto the same container port over TCP.
    #[must_use]
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{ip}:")?;
        }
        if let Some(port) = self.host_port {
            write!(f, "{port}")?;
        }
        write!(f, ":{}/{}", self.container_port, self.protocol)
    }
}

impl FromStr for PortMapping {
    type Err = TypesError;

    /// Parses docker-style `[host-ip:][host-port:]container-port[/proto]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TypesError::InvalidPortMapping(s.to_string());

        let (addr, proto) = match s.rsplit_once('/') {
            Some((addr, "tcp")) => (addr, Protocol::Tcp),
            Some((addr, "udp")) => (addr, Protocol::Udp),
            Some(_) => return Err(err()),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [cport] => (None, None, *cport),
            [hport, cport] => (None, Some(*hport), *cport),
            [ip, hport, cport] => (Some((*ip).to_string()), Some(*hport), *cport),
            _ => return Err(err()),
        };

        let container_port = container_port.parse().map_err(|_| err())?;
        let host_port = match host_port {
            Some("") | None => None,
            Some(p) => Some(p.parse().map_err(|_| err())?),
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol: proto,
        })
    }
}

/// Volume mount: named volume or host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path or volume name.
    pub source: String,
    /// Container path.
    pub target: String,
    /// Read-only mount.
    #[serde(default)]
    pub read_only: bool,
}

impl FromStr for VolumeMount {
    type Err = TypesError;

    /// Parses docker-style `source:target[:ro]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [source, target] => Ok(Self {
                source: (*source).to_string(),
                target: (*target).to_string(),
                read_only: false,
            }),
            [source, target, "ro"] => Ok(Self {
                source: (*source).to_string(),
                target: (*target).to_string(),
                read_only: true,
            }),
            _ => Err(TypesError::InvalidVolumeMount(s.to_string())),
        }
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)?;
        if self.read_only {
            f.write_str(":ro")?;
        }
        Ok(())
    }
}

/// Stage at which a lifecycle hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookStage {
    /// Against the created but not yet started container.
    PreStart,
    /// Against the running container.
    PostStart,
}

/// Action performed by a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookAction {
    /// Write a file into the container.
    WriteFile {
        dest: String,
        content: Vec<u8>,
        mode: u32,
        description: String,
    },
    /// Rewrite an existing file in the container by deep-merging a YAML
    /// document into it, existing keys losing on conflict.
    MergeYaml {
        dest: String,
        content: String,
        description: String,
    },
}

impl HookAction {
    /// Human-readable description of the action, for logs and errors.
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::WriteFile { description, .. } | Self::MergeYaml { description, .. } => description,
        }
    }
}

/// A typed lifecycle hook record, scoped to one node.
///
/// Hooks on one node run strictly sequentially in declared order; their
/// outcomes are part of node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleHook {
    pub stage: HookStage,
    pub action: HookAction,
}

/// Desired state of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Unique name within the cluster (and on the runtime).
    pub name: String,
    /// Node role.
    pub role: Role,
    /// OCI image reference.
    pub image: String,
    /// Container command, empty for the image default.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Arguments appended to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Networks to join, primary network first.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Memory limit, docker syntax (e.g. "1g").
    pub memory_limit: Option<String>,
    /// Extra `/etc/hosts` entries, `host:ip` syntax.
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    /// Labels set on the runtime object.
    #[serde(default)]
    pub runtime_labels: BTreeMap<String, String>,
    /// Kubernetes node labels passed to k3s.
    #[serde(default)]
    pub k3s_node_labels: BTreeMap<String, String>,
    /// Ordered lifecycle hooks.
    #[serde(default)]
    pub hooks: Vec<LifecycleHook>,
}

impl NodeSpec {
    /// Creates a minimal spec for the given name, role and image.
    #[must_use]
    pub fn new(name: impl Into<String>, role: Role, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            image: image.into(),
            cmd: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            networks: Vec::new(),
            memory_limit: None,
            extra_hosts: Vec::new(),
            runtime_labels: BTreeMap::new(),
            k3s_node_labels: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    /// Hooks declared for the given stage, in declared order.
    pub fn hooks_for(&self, stage: HookStage) -> impl Iterator<Item = &LifecycleHook> {
        self.hooks.iter().filter(move |h| h.stage == stage)
    }
}

/// Position of a node in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    /// Spec derived, nothing claimed.
    Planned,
    /// Labels assigned and name claimed.
    Reserved,
    /// Runtime object exists, stopped.
    Provisioned,
    /// Container started.
    Running,
    /// Role-specific readiness probe passed.
    Ready,
    /// Stopped after running.
    Stopped,
    /// Removed from the runtime.
    Deleted,
}

/// Observed state of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Lifecycle phase.
    pub phase: Option<NodePhase>,
    /// Whether the container is currently running.
    pub running: bool,
    /// Raw state string reported by the runtime.
    pub state: String,
    /// Start timestamp reported by the runtime.
    pub started_at: Option<DateTime<Utc>>,
    /// IP address on the node's first network.
    pub ip: Option<String>,
}

/// A node: spec plus observed state plus runtime identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Desired state.
    pub spec: NodeSpec,
    /// ID assigned by the runtime on create.
    pub runtime_id: Option<String>,
    /// Observed state.
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    /// Wraps a spec into an unprovisioned node.
    #[must_use]
    pub fn planned(spec: NodeSpec) -> Self {
        Self {
            spec,
            runtime_id: None,
            status: NodeStatus {
                phase: Some(NodePhase::Planned),
                ..NodeStatus::default()
            },
        }
    }

    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns the node role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.spec.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("server".parse::<Role>().unwrap(), Role::Server);
        assert_eq!("loadbalancer".parse::<Role>().unwrap(), Role::LoadBalancer);
        assert!("master".parse::<Role>().is_err());
    }

    #[test]
    fn test_port_mapping_parse_full() {
        let p: PortMapping = "127.0.0.1:8080:80/tcp".parse().unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_port_mapping_parse_short() {
        let p: PortMapping = "6443".parse().unwrap();
        assert_eq!(p.host_port, None);
        assert_eq!(p.container_port, 6443);

        let p: PortMapping = "8080:80/udp".parse().unwrap();
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.protocol, Protocol::Udp);
    }

    #[test]
    fn test_port_mapping_parse_invalid() {
        assert!("".parse::<PortMapping>().is_err());
        assert!("a:b:c:d".parse::<PortMapping>().is_err());
        assert!("8080:80/sctp".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_volume_mount_parse() {
        let v: VolumeMount = "/data:/var/lib/rancher:ro".parse().unwrap();
        assert_eq!(v.source, "/data");
        assert_eq!(v.target, "/var/lib/rancher");
        assert!(v.read_only);
        assert_eq!(v.to_string(), "/data:/var/lib/rancher:ro");

        assert!("noseparator".parse::<VolumeMount>().is_err());
    }

    #[test]
    fn test_hooks_for_stage_preserves_order() {
        let mut spec = NodeSpec::new("n", Role::Server, "img");
        for (i, stage) in [HookStage::PreStart, HookStage::PostStart, HookStage::PreStart]
            .into_iter()
            .enumerate()
        {
            spec.hooks.push(LifecycleHook {
                stage,
                action: HookAction::WriteFile {
                    dest: format!("/tmp/{i}"),
                    content: Vec::new(),
                    mode: 0o644,
                    description: format!("hook {i}"),
                },
            });
        }

        let pre: Vec<_> = spec
            .hooks_for(HookStage::PreStart)
            .map(|h| h.action.description().to_string())
            .collect();
        assert_eq!(pre, vec!["hook 0", "hook 2"]);
    }
}
