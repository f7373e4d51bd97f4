//! Transform of the user-shaped [`SimpleConfig`] into the engine-shaped
//! [`ClusterConfig`].
//!
//! Counts expand into per-node specs, node filters resolve against the
//! expanded set, and ports, volumes, env vars, files, labels and host
//! aliases materialize onto the selected nodes. Environment overrides are
//! consumed here and become deterministic changes to node specs.

use std::time::Duration;

use k3c_types::{
    image_volume_name, labels, loadbalancer_name, network_name, node_name, registry_name,
    Cluster, ClusterName, ClusterNetwork, HookAction, HookStage, Ipam, KubeApi, LifecycleHook,
    Node, NodeSpec, PortMapping, Protocol, Registry, RegistryPort, RegistryProxy, Role,
    VolumeMount, NAME_PREFIX,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::filter::{resolve, resolve_single};
use crate::model::{
    ClusterConfig, ClusterCreateOpts, HookFailurePolicy, KubeconfigOpts, RegistriesOpts,
};
use crate::parse_duration;
use crate::simple::SimpleConfig;

/// Bundled k3s image used when the config names none.
pub const DEFAULT_K3S_IMAGE: &str = "docker.io/rancher/k3s:v1.31.5-k3s1";
/// Load balancer image repository.
pub const DEFAULT_LB_IMAGE_REPO: &str = "ghcr.io/k3c-io/k3c-proxy";
/// Tools helper image repository.
pub const DEFAULT_TOOLS_IMAGE_REPO: &str = "ghcr.io/k3c-io/k3c-tools";
/// Registry image used for created registries.
pub const DEFAULT_REGISTRY_IMAGE: &str = "docker.io/library/registry:2";
/// Mount point of the per-cluster image volume inside k3s nodes.
pub const IMAGE_VOLUME_MOUNT: &str = "/k3c/images";
/// Where k3s is told to write the kubeconfig inside server containers.
pub const KUBECONFIG_OUTPUT: &str = "/output/kubeconfig.yaml";

/// Environment variable overrides consumed at transform time.
#[derive(Debug, Clone, Default)]
pub struct TransformEnv {
    pub lb_image: Option<String>,
    pub tools_image: Option<String>,
    pub helper_version: Option<String>,
    pub log_node_wait_logs: bool,
    pub fix_cgroupv2: bool,
    pub fix_dns: bool,
    pub fix_mounts: bool,
}

impl TransformEnv {
    /// Reads the `K3C_*` override variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let flag = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        Self {
            lb_image: std::env::var("K3C_IMAGE_LOADBALANCER").ok(),
            tools_image: std::env::var("K3C_IMAGE_TOOLS").ok(),
            helper_version: std::env::var("K3C_HELPER_VERSION").ok(),
            log_node_wait_logs: flag("K3C_LOG_NODE_WAIT_LOGS"),
            fix_cgroupv2: flag("K3C_FIX_CGROUPV2"),
            fix_dns: flag("K3C_FIX_DNS"),
            fix_mounts: flag("K3C_FIX_MOUNTS"),
        }
    }

    /// Effective load balancer image.
    #[must_use]
    pub fn loadbalancer_image(&self) -> String {
        self.lb_image.clone().unwrap_or_else(|| {
            format!("{DEFAULT_LB_IMAGE_REPO}:{}", self.helper_tag())
        })
    }

    /// Effective tools helper image.
    #[must_use]
    pub fn tools_helper_image(&self) -> String {
        self.tools_image.clone().unwrap_or_else(|| {
            format!("{DEFAULT_TOOLS_IMAGE_REPO}:{}", self.helper_tag())
        })
    }

    fn helper_tag(&self) -> String {
        self.helper_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }
}

/// Transforms a validated simple config into a cluster config.
pub fn transform_simple_to_cluster(
    simple: &SimpleConfig,
    env: &TransformEnv,
) -> Result<ClusterConfig> {
    let name = ClusterName::new(simple.metadata.name.clone())?;
    let token = simple.token.clone().unwrap_or_else(generate_token);

    let network = match &simple.network {
        Some(existing) => ClusterNetwork {
            name: existing.clone(),
            external: true,
            ipam: Ipam::default(),
        },
        None => ClusterNetwork {
            name: network_name(name.as_str()),
            external: false,
            ipam: Ipam {
                managed: true,
                ..Ipam::default()
            },
        },
    };

    let kube_api = {
        let simple_api = simple.kube_api.clone().unwrap_or_default();
        KubeApi {
            host: simple_api.host,
            host_ip: simple_api.host_ip.unwrap_or_else(|| "0.0.0.0".to_string()),
            host_port: simple_api.host_port.unwrap_or(6443),
            container_port: 6443,
        }
    };
    let api_url = kube_api.url();

    let k3s_image = simple
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_K3S_IMAGE.to_string());
    let image_volume = (!simple.options.k3c.disable_image_volume)
        .then(|| image_volume_name(name.as_str()));

    let with_lb = !simple.options.k3c.disable_loadbalancer && simple.servers >= 1;
    let init_server_name = node_name(name.as_str(), Role::Server, 0);

    let mut specs: Vec<NodeSpec> = Vec::new();

    for i in 0..simple.servers {
        let mut spec = NodeSpec::new(
            node_name(name.as_str(), Role::Server, i as usize),
            Role::Server,
            k3s_image.clone(),
        );
        spec.cmd = vec!["server".to_string()];
        if let Some(host) = &kube_api.host {
            spec.args.push(format!("--tls-san={host}"));
        }
        spec.env
            .insert("K3S_TOKEN".to_string(), token.clone());
        spec.env.insert(
            "K3S_KUBECONFIG_OUTPUT".to_string(),
            KUBECONFIG_OUTPUT.to_string(),
        );
        if simple.servers > 1 {
            if i == 0 {
                spec.args.push("--cluster-init".to_string());
            } else {
                spec.env.insert(
                    "K3S_URL".to_string(),
                    format!("https://{init_server_name}:6443"),
                );
            }
        }
        specs.push(spec);
    }

    for i in 0..simple.agents {
        let mut spec = NodeSpec::new(
            node_name(name.as_str(), Role::Agent, i as usize),
            Role::Agent,
            k3s_image.clone(),
        );
        spec.cmd = vec!["agent".to_string()];
        spec.env
            .insert("K3S_TOKEN".to_string(), token.clone());
        spec.env.insert(
            "K3S_URL".to_string(),
            format!("https://{init_server_name}:6443"),
        );
        specs.push(spec);
    }

    if with_lb {
        let mut spec = NodeSpec::new(
            loadbalancer_name(name.as_str()),
            Role::LoadBalancer,
            env.loadbalancer_image(),
        );
        // the API port is published on the LB, never on servers directly
        spec.ports.push(PortMapping {
            host_ip: Some(kube_api.host_ip.clone()),
            host_port: Some(kube_api.host_port),
            container_port: kube_api.container_port,
            protocol: Protocol::Tcp,
        });
        specs.push(spec);
    } else if let Some(first_server) = specs.iter_mut().find(|s| s.role == Role::Server) {
        first_server.ports.push(PortMapping {
            host_ip: Some(kube_api.host_ip.clone()),
            host_port: Some(kube_api.host_port),
            container_port: kube_api.container_port,
            protocol: Protocol::Tcp,
        });
    }

    // shared spec surgery applied to every node
    for spec in &mut specs {
        spec.networks.push(network.name.clone());
        spec.runtime_labels
            .extend(labels::standard(name.as_str(), spec.role, &api_url, &token));
        if spec.role.is_k3s() {
            if let Some(volume) = &image_volume {
                spec.volumes.push(VolumeMount {
                    source: volume.clone(),
                    target: IMAGE_VOLUME_MOUNT.to_string(),
                    read_only: false,
                });
            }
            for (enabled, key) in [
                (env.fix_cgroupv2, "K3C_FIX_CGROUPV2"),
                (env.fix_dns, "K3C_FIX_DNS"),
                (env.fix_mounts, "K3C_FIX_MOUNTS"),
            ] {
                if enabled {
                    spec.env.insert(key.to_string(), "1".to_string());
                }
            }
        }
    }

    let init_node = (simple.servers > 1).then(|| init_server_name.clone());
    if init_node.is_some() {
        if let Some(spec) = specs.iter_mut().find(|s| s.name == init_server_name) {
            spec.runtime_labels
                .insert(labels::LABEL_SERVER_INIT.to_string(), "true".to_string());
        }
    }

    let lb_extra_ports = apply_ports(simple, &mut specs)?;
    if !lb_extra_ports.is_empty() {
        // persisted on the LB container so later membership resyncs can
        // rebuild the port map from labels alone
        let joined = lb_extra_ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        if let Some(lb) = specs.iter_mut().find(|s| s.role == Role::LoadBalancer) {
            lb.runtime_labels
                .insert(labels::LABEL_LB_PORTS.to_string(), joined);
        }
    }
    apply_volumes(simple, &mut specs)?;
    apply_env(simple, &mut specs)?;
    apply_k3s_options(simple, &mut specs)?;
    apply_files(simple, &mut specs)?;

    let registries = transform_registries(simple, name.as_str())?;

    let timeout = match &simple.options.k3c.timeout {
        Some(raw) => Some(parse_duration(raw).ok_or_else(|| {
            ConfigError::SchemaViolation(vec![crate::error::Violation {
                code: "timeout-invalid".to_string(),
                path: "options.k3c.timeout".to_string(),
                message: format!("cannot parse duration '{raw}'"),
            }])
        })?),
        None => None,
    };

    let cluster = Cluster {
        name,
        token,
        network,
        nodes: specs.into_iter().map(Node::planned).collect(),
        init_node,
        kube_api,
        image_volume,
    };

    debug!(
        cluster = %cluster.name,
        servers = cluster.server_count(),
        agents = cluster.agent_count(),
        lb = cluster.loadbalancer().is_some(),
        "transformed simple config"
    );

    Ok(ClusterConfig {
        cluster,
        create_opts: ClusterCreateOpts {
            wait_for_ready: simple.options.k3c.wait,
            timeout,
            disable_load_balancer: simple.options.k3c.disable_loadbalancer,
            disable_image_volume: simple.options.k3c.disable_image_volume,
            node_wait_logs: simple.options.k3c.node_wait_logs || env.log_node_wait_logs,
            hook_failure_policy: if simple.options.k3c.strict_hooks {
                HookFailurePolicy::Strict
            } else {
                HookFailurePolicy::WarnAndContinue
            },
            registries,
            lb_extra_ports,
        },
        kubeconfig_opts: KubeconfigOpts {
            update_default: simple.options.kubeconfig.update_default,
            switch_current_context: simple.options.kubeconfig.switch_current_context,
        },
    })
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Distributes port bindings. Ports bound to the load balancer must target
/// exactly it and are additionally recorded for the config synthesizer;
/// everything else lands on the selected nodes directly. A fixed host port
/// can only be claimed once across the whole cluster.
fn apply_ports(simple: &SimpleConfig, specs: &mut [NodeSpec]) -> Result<Vec<PortMapping>> {
    let mut lb_extra = Vec::new();
    let mut claimed: std::collections::BTreeSet<(String, u16)> = std::collections::BTreeSet::new();
    let mut claim = |mapping: &PortMapping| -> Result<()> {
        if let Some(host_port) = mapping.host_port {
            let key = (mapping.host_ip.clone().unwrap_or_default(), host_port);
            if !claimed.insert(key) {
                return Err(ConfigError::DuplicatePortBinding(host_port.to_string()));
            }
        }
        Ok(())
    };

    for entry in &simple.ports {
        let mapping: PortMapping = entry.port.parse()?;
        let targets = resolve(&entry.node_filters, specs)?;
        let hits_lb = targets
            .iter()
            .any(|&i| specs[i].role == Role::LoadBalancer);

        if hits_lb {
            let i = resolve_single(&entry.node_filters, specs)?;
            claim(&mapping)?;
            specs[i].ports.push(mapping.clone());
            lb_extra.push(mapping);
        } else {
            for i in targets {
                claim(&mapping)?;
                specs[i].ports.push(mapping.clone());
            }
        }
    }

    Ok(lb_extra)
}

fn apply_volumes(simple: &SimpleConfig, specs: &mut [NodeSpec]) -> Result<()> {
    for entry in &simple.volumes {
        let mount: VolumeMount = entry.volume.parse()?;
        for i in resolve(&entry.node_filters, specs)? {
            specs[i].volumes.push(mount.clone());
        }
    }
    Ok(())
}

fn apply_env(simple: &SimpleConfig, specs: &mut [NodeSpec]) -> Result<()> {
    for entry in &simple.env {
        let (key, value) = entry.env_var.split_once('=').ok_or_else(|| {
            ConfigError::SchemaViolation(vec![crate::error::Violation {
                code: "env-invalid".to_string(),
                path: "env".to_string(),
                message: format!("expected KEY=VALUE, got '{}'", entry.env_var),
            }])
        })?;
        for i in resolve(&entry.node_filters, specs)? {
            specs[i].env.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

fn apply_k3s_options(simple: &SimpleConfig, specs: &mut [NodeSpec]) -> Result<()> {
    for entry in &simple.options.k3s.extra_args {
        for i in resolve(&entry.node_filters, specs)? {
            if specs[i].role.is_k3s() {
                specs[i].args.push(entry.arg.clone());
            }
        }
    }
    for entry in &simple.options.k3s.node_labels {
        let (key, value) = entry.label.split_once('=').unwrap_or((entry.label.as_str(), ""));
        for i in resolve(&entry.node_filters, specs)? {
            if specs[i].role.is_k3s() {
                specs[i]
                    .k3s_node_labels
                    .insert(key.to_string(), value.to_string());
            }
        }
    }
    Ok(())
}

fn apply_files(simple: &SimpleConfig, specs: &mut [NodeSpec]) -> Result<()> {
    for entry in &simple.files {
        let content = std::fs::read(&entry.source)
            .map_err(|e| ConfigError::Common(k3c_error::CommonError::from(e)))?;
        let hook = LifecycleHook {
            stage: HookStage::PreStart,
            action: HookAction::WriteFile {
                dest: entry.destination.clone(),
                content,
                mode: 0o644,
                description: if entry.description.is_empty() {
                    format!("user file {}", entry.destination)
                } else {
                    entry.description.clone()
                },
            },
        };
        for i in resolve(&entry.node_filters, specs)? {
            specs[i].hooks.push(hook.clone());
        }
    }
    Ok(())
}

/// Resolves the registry block.
///
/// A syntactically present but all-default `create` transforms to absent,
/// so inherited defaults never synthesize a registry by accident.
fn transform_registries(simple: &SimpleConfig, cluster: &str) -> Result<RegistriesOpts> {
    let create = simple
        .registries
        .create
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| {
            let reg_name = ensure_prefixed(
                c.name
                    .clone()
                    .unwrap_or_else(|| registry_name(cluster)),
            );
            Registry {
                host: c.host.clone().unwrap_or_else(|| reg_name.clone()),
                name: reg_name,
                image: c
                    .image
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REGISTRY_IMAGE.to_string()),
                port: RegistryPort {
                    host_ip: None,
                    host_port: c.host_port,
                    container_port: k3c_types::REGISTRY_CONTAINER_PORT,
                },
                external: false,
                networks: vec![network_name(cluster)],
                proxy: c.proxy.as_ref().map(|p| RegistryProxy {
                    remote_url: p.remote_url.clone(),
                    username: p.username.clone(),
                    password: p.password.clone(),
                }),
                volumes: c.volumes.clone(),
            }
        });

    let use_: Vec<String> = simple
        .registries
        .use_
        .iter()
        .map(|n| ensure_prefixed(n.clone()))
        .collect();

    Ok(RegistriesOpts {
        create,
        use_,
        config: simple.registries.config.clone(),
    })
}

fn ensure_prefixed(name: String) -> String {
    if name.starts_with(&format!("{NAME_PREFIX}-")) {
        name
    } else {
        format!("{NAME_PREFIX}-{name}")
    }
}
