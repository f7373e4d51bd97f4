//! Registry model.
//!
//! A registry is an independently lifecycled container: clusters reference
//! it, but only a registry created inline with a cluster shares that
//! cluster's lifetime.

use serde::{Deserialize, Serialize};

/// Default port the registry process listens on inside its container.
pub const REGISTRY_CONTAINER_PORT: u16 = 5000;

/// Port exposure of a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPort {
    /// Host interface to bind, if restricted.
    pub host_ip: Option<String>,
    /// Host port; `None` lets the runtime pick one.
    pub host_port: Option<u16>,
    /// Port inside the container.
    pub container_port: u16,
}

impl Default for RegistryPort {
    fn default() -> Self {
        Self {
            host_ip: None,
            host_port: None,
            container_port: REGISTRY_CONTAINER_PORT,
        }
    }
}

/// Pull-through proxy settings for a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryProxy {
    /// Upstream registry URL.
    pub remote_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// An OCI registry container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Container name.
    pub name: String,
    /// Hostname clusters use to reach the registry.
    pub host: String,
    /// OCI image of the registry itself.
    pub image: String,
    /// Port exposure.
    #[serde(default)]
    pub port: RegistryPort,
    /// True when the registry pre-existed and is only referenced; external
    /// registries are never started, stopped or deleted by cluster ops.
    #[serde(default)]
    pub external: bool,
    /// Networks the registry is connected to.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Pull-through proxy settings, when configured.
    pub proxy: Option<RegistryProxy>,
    /// Extra volume mounts, docker `source:target` syntax.
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl Registry {
    /// In-network endpoint of the registry, `host:port`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port.container_port)
    }

    /// Host-visible endpoint, when a host port is published.
    #[must_use]
    pub fn host_endpoint(&self) -> Option<String> {
        self.port.host_port.map(|p| format!("{}:{p}", self.host))
    }
}
