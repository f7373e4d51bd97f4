//! Registry lifecycle and cluster wiring.
//!
//! Registries are independently lifecycled containers. A cluster either
//! creates one (shared lifetime), uses an existing one (joined to the
//! cluster network, never started, stopped or deleted by cluster ops), or
//! merges user-supplied registry configuration over the generated one.

use std::collections::BTreeMap;

use chrono::Utc;
use k3c_config::merge_values;
use k3c_runtime::DynRuntime;
use k3c_types::{
    labels, HookAction, HookStage, LifecycleHook, NodeSpec, PortMapping, Protocol, Registry,
    RegistryPort, Role,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::event::{Event, EventBus};
use crate::node::NodeManager;

/// Where k3s reads per-node registry configuration.
pub const REGISTRIES_YAML_PATH: &str = "/etc/rancher/k3s/registries.yaml";
/// Staging path for the hosting config map inside a server node.
const HOSTING_CM_PATH: &str = "/tmp/k3c-local-registry-hosting.yaml";

/// Manages registry containers and their cluster associations.
pub struct RegistryManager {
    runtime: DynRuntime,
    nodes: NodeManager,
    events: EventBus,
}

impl RegistryManager {
    /// Creates a manager bound to a runtime and event bus.
    #[must_use]
    pub fn new(runtime: DynRuntime, events: EventBus) -> Self {
        Self {
            nodes: NodeManager::new(runtime.clone(), events.clone()),
            runtime,
            events,
        }
    }

    /// Builds the container spec for a registry.
    ///
    /// `cluster` carries `(name, api_url, token)` when the registry is owned
    /// by a cluster; a standalone registry gets the base label set only.
    #[must_use]
    pub fn node_spec(registry: &Registry, cluster: Option<(&str, &str, &str)>) -> NodeSpec {
        let mut spec = NodeSpec::new(registry.name.clone(), Role::Registry, registry.image.clone());
        spec.networks = registry.networks.clone();
        spec.ports.push(PortMapping {
            host_ip: registry.port.host_ip.clone(),
            host_port: registry.port.host_port,
            container_port: registry.port.container_port,
            protocol: Protocol::Tcp,
        });

        spec.runtime_labels = match cluster {
            Some((name, url, token)) => labels::standard(name, Role::Registry, url, token),
            None => {
                let mut base = BTreeMap::new();
                base.insert(labels::LABEL_APP.to_string(), labels::APP_NAME.to_string());
                base.insert(
                    labels::LABEL_ROLE.to_string(),
                    Role::Registry.as_str().to_string(),
                );
                base
            }
        };
        spec.runtime_labels.insert(
            labels::LABEL_REGISTRY_HOST.to_string(),
            registry.host.clone(),
        );

        if let Some(proxy) = &registry.proxy {
            spec.env.insert(
                "REGISTRY_PROXY_REMOTEURL".to_string(),
                proxy.remote_url.clone(),
            );
            if let Some(username) = &proxy.username {
                spec.env
                    .insert("REGISTRY_PROXY_USERNAME".to_string(), username.clone());
            }
            if let Some(password) = &proxy.password {
                spec.env
                    .insert("REGISTRY_PROXY_PASSWORD".to_string(), password.clone());
            }
        }

        for volume in &registry.volumes {
            if let Ok(mount) = volume.parse() {
                spec.volumes.push(mount);
            }
        }

        spec
    }

    /// Creates and starts a registry container, waiting for it to listen.
    pub async fn create(
        &self,
        registry: &Registry,
        cluster: Option<(&str, &str, &str)>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = Self::node_spec(registry, cluster);
        let since = Utc::now();
        self.nodes.create(&spec, cancel).await?;
        self.nodes.start(&spec, cancel).await?;
        self.nodes
            .wait_ready(&spec, since, std::time::Duration::from_secs(60), false, cancel)
            .await?;
        self.events.publish(Event::RegistryCreated {
            registry: registry.name.clone(),
        });
        info!(registry = %registry.name, "registry created");
        Ok(())
    }

    /// Deletes a registry container.
    pub async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.nodes.delete(name, cancel).await
    }

    /// Lists all registry containers known to the runtime.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Registry>> {
        let filters = vec![
            (
                labels::LABEL_APP.to_string(),
                labels::APP_NAME.to_string(),
            ),
            (
                labels::LABEL_ROLE.to_string(),
                Role::Registry.as_str().to_string(),
            ),
        ];
        let containers = self.runtime.container_list(&filters, cancel).await?;
        containers.iter().map(registry_from_container).collect()
    }

    /// Returns a registry's identity and network memberships.
    ///
    /// Proxy configuration is not reported; the contract reserves it for a
    /// future extension.
    pub async fn get(&self, name: &str, cancel: &CancellationToken) -> Result<Registry> {
        let info = self.runtime.container_inspect(name, cancel).await?;
        registry_from_container(&info)
    }

    /// Joins a registry to a network unless it is already attached.
    pub async fn connect(
        &self,
        name: &str,
        network: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let info = self.runtime.container_inspect(name, cancel).await?;
        if info.networks.iter().any(|n| n.network == network) {
            debug!(registry = name, network, "already joined");
            return Ok(false);
        }
        self.runtime
            .network_connect(name, network, None, cancel)
            .await?;
        info!(registry = name, network, "joined to cluster network");
        Ok(true)
    }

    /// Applies the LocalRegistryHostingConfigMap inside a server node so
    /// in-cluster tooling can discover the referenced registries.
    pub async fn apply_hosting_configmap(
        &self,
        server_node: &str,
        registries: &[Registry],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if registries.is_empty() {
            return Ok(());
        }
        let doc = hosting_configmap(registries);
        self.runtime
            .copy_to_container(server_node, HOSTING_CM_PATH, doc.as_bytes(), 0o644, cancel)
            .await?;
        let cmd = vec![
            "kubectl".to_string(),
            "apply".to_string(),
            "-f".to_string(),
            HOSTING_CM_PATH.to_string(),
        ];
        let result = self.runtime.exec(server_node, &cmd, cancel).await?;
        if !result.success() {
            return Err(CoreError::Hook {
                node: server_node.to_string(),
                description: "apply local-registry-hosting configmap".to_string(),
                message: result.stderr,
            });
        }
        Ok(())
    }
}

/// Rebuilds a registry description from its labelled container.
fn registry_from_container(info: &k3c_runtime::ContainerInfo) -> Result<Registry> {
    let host = info
        .labels
        .get(labels::LABEL_REGISTRY_HOST)
        .cloned()
        .ok_or_else(|| {
            CoreError::Types(k3c_types::TypesError::MissingLabel {
                container: info.name.clone(),
                label: labels::LABEL_REGISTRY_HOST.to_string(),
            })
        })?;

    Ok(Registry {
        name: info.name.clone(),
        host,
        image: info.image.clone(),
        port: RegistryPort::default(),
        external: !info
            .labels
            .contains_key(labels::LABEL_CLUSTER),
        networks: info.networks.iter().map(|n| n.network.clone()).collect(),
        proxy: None,
        volumes: Vec::new(),
    })
}

/// Generates the per-node `registries.yaml` for a set of registries and
/// merges the user-supplied document over it, user keys winning.
pub fn registries_yaml(registries: &[Registry], user_config: Option<&str>) -> Result<String> {
    let mut mirrors = serde_yaml::Mapping::new();
    for registry in registries {
        let mut endpoint_list = Vec::new();
        endpoint_list.push(serde_yaml::Value::from(format!(
            "http://{}",
            registry.endpoint()
        )));
        let mut mirror = serde_yaml::Mapping::new();
        mirror.insert(
            serde_yaml::Value::from("endpoint"),
            serde_yaml::Value::Sequence(endpoint_list),
        );
        mirrors.insert(
            serde_yaml::Value::from(registry.endpoint()),
            serde_yaml::Value::Mapping(mirror),
        );
        if let Some(host_endpoint) = registry.host_endpoint() {
            if host_endpoint != registry.endpoint() {
                let mut alias = serde_yaml::Mapping::new();
                alias.insert(
                    serde_yaml::Value::from("endpoint"),
                    serde_yaml::Value::Sequence(vec![serde_yaml::Value::from(format!(
                        "http://{}",
                        registry.endpoint()
                    ))]),
                );
                mirrors.insert(
                    serde_yaml::Value::from(host_endpoint),
                    serde_yaml::Value::Mapping(alias),
                );
            }
        }
    }

    let mut generated = serde_yaml::Mapping::new();
    generated.insert(
        serde_yaml::Value::from("mirrors"),
        serde_yaml::Value::Mapping(mirrors),
    );
    let mut doc = serde_yaml::Value::Mapping(generated);

    if let Some(user) = user_config {
        let user: serde_yaml::Value = serde_yaml::from_str(user)
            .map_err(|e| CoreError::Common(k3c_error::CommonError::config(e.to_string())))?;
        doc = merge_values(doc, user);
    }

    serde_yaml::to_string(&doc)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))
}

/// Builds the pre-start hook that injects `registries.yaml` into a node.
#[must_use]
pub fn registries_hook(rendered_yaml: String) -> LifecycleHook {
    LifecycleHook {
        stage: HookStage::PreStart,
        action: HookAction::WriteFile {
            dest: REGISTRIES_YAML_PATH.to_string(),
            content: rendered_yaml.into_bytes(),
            mode: 0o644,
            description: "inject registries.yaml".to_string(),
        },
    }
}

/// Renders the LocalRegistryHostingConfigMap document.
///
/// The standard discovery fields describe the first registry; every
/// referenced registry is enumerated under `registries`.
#[must_use]
pub fn hosting_configmap(registries: &[Registry]) -> String {
    let first = &registries[0];
    let host = first
        .host_endpoint()
        .unwrap_or_else(|| first.endpoint());

    let mut body = String::new();
    body.push_str(&format!("host: \"{host}\"\n"));
    body.push_str(&format!(
        "hostFromContainerRuntime: \"{}\"\n",
        first.endpoint()
    ));
    body.push_str("registries:\n");
    for registry in registries {
        body.push_str(&format!("  - \"{}\"\n", registry.endpoint()));
    }

    let mut doc = String::new();
    doc.push_str("apiVersion: v1\nkind: ConfigMap\nmetadata:\n");
    doc.push_str("  name: local-registry-hosting\n  namespace: kube-public\ndata:\n");
    doc.push_str("  localRegistryHosting.v1: |\n");
    for line in body.lines() {
        doc.push_str(&format!("    {line}\n"));
    }
    doc
}
