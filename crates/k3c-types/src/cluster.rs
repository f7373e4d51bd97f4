//! Cluster aggregate and its network.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::node::{Node, Role};

/// Maximum length of a cluster name.
///
/// Node names derived from the cluster name must stay within the hostname
/// limit once role and index suffixes are appended.
pub const MAX_CLUSTER_NAME_LEN: usize = 32;

/// Validated cluster name.
///
/// Must form a DNS label: lowercase alphanumerics and dashes, starting and
/// ending alphanumeric, at most [`MAX_CLUSTER_NAME_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterName(String);

impl ClusterName {
    /// Validates and wraps a cluster name.
    ///
    /// # Errors
    ///
    /// Returns [`TypesError::InvalidClusterName`] when the name is not a DNS
    /// label or exceeds the length limit.
    pub fn new(name: impl Into<String>) -> Result<Self, TypesError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(TypesError::InvalidClusterName(name));
        }
        let bytes = name.as_bytes();
        let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
            return Err(TypesError::InvalidClusterName(name));
        }
        if !bytes.iter().all(|&b| alnum(b) || b == b'-') {
            return Err(TypesError::InvalidClusterName(name));
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for ClusterName {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ClusterName {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClusterName> for String {
    fn from(value: ClusterName) -> Self {
        value.0
    }
}

/// IP address management state of a cluster network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipam {
    /// Whether k3c manages address allocation on this network.
    pub managed: bool,
    /// Subnet prefix in CIDR notation, when known.
    pub ip_prefix: Option<String>,
    /// Addresses currently handed out.
    #[serde(default)]
    pub ips_used: Vec<String>,
}

/// The network a cluster's nodes share.
///
/// A cluster owns a managed network; an external (adopted) network is only
/// referenced and never deleted by cluster operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Network name on the runtime.
    pub name: String,
    /// True when the network pre-existed and was adopted.
    pub external: bool,
    /// Address management state.
    #[serde(default)]
    pub ipam: Ipam,
}

/// Kube API endpoint exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApi {
    /// Hostname written into the kubeconfig and TLS SANs.
    pub host: Option<String>,
    /// Host interface the API port binds to.
    pub host_ip: String,
    /// Host port the API is published on.
    pub host_port: u16,
    /// API port inside server containers, always 6443.
    pub container_port: u16,
}

impl Default for KubeApi {
    fn default() -> Self {
        Self {
            host: None,
            host_ip: "0.0.0.0".to_string(),
            host_port: 6443,
            container_port: 6443,
        }
    }
}

impl KubeApi {
    /// URL advertised to joining nodes and written into labels.
    #[must_use]
    pub fn url(&self) -> String {
        let host = self.host.as_deref().unwrap_or(&self.host_ip);
        format!("https://{host}:{}", self.host_port)
    }
}

/// Cluster aggregate: nodes, network, token and API endpoint.
///
/// Nodes are stored as children; a node refers back to its cluster by name
/// only, so the object graph stays acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster name.
    pub name: ClusterName,
    /// Join secret shared by all nodes.
    pub token: String,
    /// Primary network.
    pub network: ClusterNetwork,
    /// Nodes in creation order.
    pub nodes: Vec<Node>,
    /// Name of the designated init server; set iff more than one server.
    pub init_node: Option<String>,
    /// Kube API exposure.
    pub kube_api: KubeApi,
    /// Per-cluster volume for side-loaded images, when enabled.
    pub image_volume: Option<String>,
}

impl Cluster {
    /// Nodes of the given role, in order.
    pub fn nodes_by_role(&self, role: Role) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.role() == role)
    }

    /// Number of server nodes.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.nodes_by_role(Role::Server).count()
    }

    /// Number of agent nodes.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.nodes_by_role(Role::Agent).count()
    }

    /// The server load balancer node, if the cluster has one.
    #[must_use]
    pub fn loadbalancer(&self) -> Option<&Node> {
        self.nodes_by_role(Role::LoadBalancer).next()
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Mutable lookup of a node by name.
    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.spec.name == name)
    }

    /// The init server: the designated one in HA topologies, otherwise the
    /// first (and only) server.
    #[must_use]
    pub fn init_server(&self) -> Option<&Node> {
        match &self.init_node {
            Some(name) => self.node(name),
            None => self.nodes_by_role(Role::Server).next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_name_valid() {
        assert!(ClusterName::new("dev").is_ok());
        assert!(ClusterName::new("my-cluster-01").is_ok());
        assert!(ClusterName::new("0abc").is_ok());
    }

    #[test]
    fn test_cluster_name_invalid() {
        assert!(ClusterName::new("").is_err());
        assert!(ClusterName::new("-leading").is_err());
        assert!(ClusterName::new("trailing-").is_err());
        assert!(ClusterName::new("UpperCase").is_err());
        assert!(ClusterName::new("under_score").is_err());
        assert!(ClusterName::new("a".repeat(33)).is_err());
        assert!(ClusterName::new("a".repeat(32)).is_ok());
    }

    #[test]
    fn test_kube_api_url() {
        let api = KubeApi::default();
        assert_eq!(api.url(), "https://0.0.0.0:6443");

        let api = KubeApi {
            host: Some("k3c.example.com".to_string()),
            host_port: 6550,
            ..KubeApi::default()
        };
        assert_eq!(api.url(), "https://k3c.example.com:6550");
    }
}
