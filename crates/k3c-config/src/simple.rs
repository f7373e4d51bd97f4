//! User-shaped configuration (`kind: Simple`), current schema version.

use serde::{Deserialize, Serialize};

/// apiVersion of the current schema.
pub const API_VERSION_CURRENT: &str = "k3c.io/v1alpha5";
/// All accepted apiVersions, oldest first.
pub const API_VERSIONS: [&str; 4] = [
    "k3c.io/v1alpha2",
    "k3c.io/v1alpha3",
    "k3c.io/v1alpha4",
    API_VERSION_CURRENT,
];
/// The only accepted document kind.
pub const KIND_SIMPLE: &str = "Simple";

/// The user-facing cluster description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleConfig {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    /// Number of server nodes, at least 1.
    pub servers: u32,
    /// Number of agent nodes.
    pub agents: u32,
    /// OCI image for k3s nodes; empty means the bundled default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Existing network to adopt instead of creating one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Cluster-join token; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_api: Option<SimpleKubeApi>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortWithFilters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeWithFilters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvWithFilters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileWithFilters>,
    pub registries: SimpleRegistries,
    pub options: SimpleOptions,
}

impl SimpleConfig {
    /// An empty config at the current version.
    #[must_use]
    pub fn current(name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION_CURRENT.to_string(),
            kind: KIND_SIMPLE.to_string(),
            metadata: Metadata { name: name.into() },
            servers: 1,
            ..Self::default()
        }
    }
}

/// Document metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

/// Kube API exposure settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleKubeApi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

/// A port binding scoped by node filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortWithFilters {
    /// Docker-style port mapping string.
    pub port: String,
    pub node_filters: Vec<String>,
}

/// A volume mount scoped by node filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeWithFilters {
    /// Docker-style `source:target[:ro]` string.
    pub volume: String,
    pub node_filters: Vec<String>,
}

/// An environment variable scoped by node filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvWithFilters {
    /// `KEY=VALUE` string.
    pub env_var: String,
    pub node_filters: Vec<String>,
}

/// A file copied into nodes before start, scoped by node filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileWithFilters {
    pub description: String,
    /// Host path of the content.
    pub source: String,
    /// Path inside the node.
    pub destination: String,
    pub node_filters: Vec<String>,
}

/// Registry wiring for the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleRegistries {
    /// Registry to create alongside the cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<RegistryCreate>,
    /// Existing registries to reference.
    #[serde(rename = "use", skip_serializing_if = "Vec::is_empty")]
    pub use_: Vec<String>,
    /// Inline registries.yaml merged over the generated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// Spec of a registry created with the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryCreate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<RegistryProxyCreate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

impl RegistryCreate {
    /// True when the block is syntactically present but carries no content.
    ///
    /// Loaders hand us a non-nil placeholder whenever the `registries`
    /// namespace has any data at all; an all-default `create` must not
    /// synthesize a registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Pull-through proxy settings of a created registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryProxyCreate {
    pub remote_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Option groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleOptions {
    pub k3c: K3cOptions,
    pub k3s: K3sOptions,
    pub kubeconfig: KubeconfigOptions,
}

/// Orchestrator behavior switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K3cOptions {
    /// Wait for the cluster to be ready before returning.
    pub wait: bool,
    /// Overall timeout, e.g. "120s", "5m".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    pub disable_loadbalancer: bool,
    pub disable_image_volume: bool,
    /// Elevate pre-start hook failures to fatal errors.
    pub strict_hooks: bool,
    /// Mirror node logs while waiting for readiness.
    pub node_wait_logs: bool,
}

impl Default for K3cOptions {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
            disable_loadbalancer: false,
            disable_image_volume: false,
            strict_hooks: false,
            node_wait_logs: false,
        }
    }
}

/// Flags and labels passed down to k3s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K3sOptions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<ArgWithFilters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_labels: Vec<LabelWithFilters>,
}

/// One k3s flag scoped by node filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgWithFilters {
    pub arg: String,
    pub node_filters: Vec<String>,
}

/// One kubernetes node label scoped by node filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelWithFilters {
    /// `key=value` string.
    pub label: String,
    pub node_filters: Vec<String>,
}

/// Kubeconfig handling after a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeconfigOptions {
    /// Merge the new context into the default kubeconfig file.
    pub update_default: bool,
    /// Select the new context as current.
    pub switch_current_context: bool,
}

impl Default for KubeconfigOptions {
    fn default() -> Self {
        Self {
            update_default: true,
            switch_current_context: true,
        }
    }
}
