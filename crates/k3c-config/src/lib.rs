//! Configuration pipeline for k3c.
//!
//! Turns an opaque user-supplied YAML tree plus command-line overrides into
//! a validated, engine-shaped [`ClusterConfig`]. Stages run in order:
//!
//! 1. identify the document's `apiVersion`,
//! 2. migrate through the linear version chain to the current schema,
//! 3. schema-validate, reporting every violation at once,
//! 4. merge sources by precedence (flags > primary > includes > defaults),
//! 5. transform the user-shaped [`SimpleConfig`] into a [`ClusterConfig`].
//!
//! File I/O and env binding live in the caller; this crate only sees value
//! trees.

mod error;
mod filter;
mod merge;
mod migrate;
mod model;
mod simple;
mod transform;
mod validate;

use std::time::Duration;

use serde_yaml::Value;

pub use error::{ConfigError, Result, Violation};
pub use filter::{parse_filters, resolve, resolve_single, NodeFilter};
pub use merge::{merge_all, merge_values};
pub use migrate::{identify_version, migrate};
pub use model::{
    ClusterConfig, ClusterCreateOpts, HookFailurePolicy, KubeconfigOpts, RegistriesOpts,
};
pub use simple::{
    ArgWithFilters, EnvWithFilters, FileWithFilters, K3cOptions, K3sOptions, KubeconfigOptions,
    LabelWithFilters, Metadata, PortWithFilters, RegistryCreate, RegistryProxyCreate,
    SimpleConfig, SimpleKubeApi, SimpleOptions, SimpleRegistries, VolumeWithFilters,
    API_VERSIONS, API_VERSION_CURRENT, KIND_SIMPLE,
};
pub use transform::{
    transform_simple_to_cluster, TransformEnv, DEFAULT_K3S_IMAGE, DEFAULT_LB_IMAGE_REPO,
    DEFAULT_REGISTRY_IMAGE, DEFAULT_TOOLS_IMAGE_REPO, IMAGE_VOLUME_MOUNT, KUBECONFIG_OUTPUT,
};
pub use validate::{check, validate};

use k3c_types::{PortMapping, Role};

/// Runs stages 1-4 over raw documents and deserializes the result.
///
/// `includes` are lower precedence than `primary`; `overrides` (already
/// current-version fragments, typically from flags) are highest. Field
/// defaults below all of them come from the schema itself.
pub fn process_config_sources(
    primary: Value,
    includes: Vec<Value>,
    overrides: Option<Value>,
) -> Result<SimpleConfig> {
    let primary = migrate(primary)?;
    validate(&primary)?;

    let mut sources: Vec<Value> = includes
        .into_iter()
        .map(migrate)
        .collect::<Result<Vec<_>>>()?;
    sources.push(primary);
    if let Some(overrides) = overrides {
        sources.push(overrides);
    }

    let merged = merge_all(sources);
    validate(&merged)?;
    Ok(serde_yaml::from_value(merged)?)
}

/// Full pipeline: raw documents to engine-shaped config.
pub fn load_cluster_config(
    primary: Value,
    includes: Vec<Value>,
    overrides: Option<Value>,
    env: &TransformEnv,
) -> Result<ClusterConfig> {
    let simple = process_config_sources(primary, includes, overrides)?;
    transform_simple_to_cluster(&simple, env)
}

/// Parses durations of the form `90`, `90s`, `5m` or `2h`.
#[must_use]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier = match suffix {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return None,
    };
    Some(Duration::from_secs(value * multiplier))
}

/// Reconstructs the declarative surface from an engine-shaped config.
///
/// Derived material (join env vars, the image volume mount, init-node
/// arguments, the API port binding) is dropped and regenerates on the next
/// transform; user-declared ports, volumes, env vars, k3s args and node
/// labels are recovered with per-node filters. File hooks cannot be
/// recovered, since their source files live outside the config.
#[must_use]
pub fn simple_from_cluster_config(cfg: &ClusterConfig) -> SimpleConfig {
    let cluster = &cfg.cluster;
    let mut simple = SimpleConfig::current(cluster.name.as_str());

    simple.servers = cluster.server_count() as u32;
    simple.agents = cluster.agent_count() as u32;
    simple.token = Some(cluster.token.clone());
    simple.image = cluster
        .nodes_by_role(Role::Server)
        .next()
        .map(|n| n.spec.image.clone());
    simple.network = cluster.network.external.then(|| cluster.network.name.clone());
    simple.kube_api = Some(SimpleKubeApi {
        host: cluster.kube_api.host.clone(),
        host_ip: Some(cluster.kube_api.host_ip.clone()),
        host_port: Some(cluster.kube_api.host_port),
    });

    recover_node_scoped(cfg, &mut simple);

    for mapping in &cfg.create_opts.lb_extra_ports {
        simple.ports.push(PortWithFilters {
            port: mapping.to_string(),
            node_filters: vec!["loadbalancer".to_string()],
        });
    }

    simple.registries = SimpleRegistries {
        create: cfg.create_opts.registries.create.as_ref().map(|r| RegistryCreate {
            name: Some(r.name.clone()),
            host: Some(r.host.clone()),
            host_port: r.port.host_port,
            image: Some(r.image.clone()),
            proxy: r.proxy.as_ref().map(|p| RegistryProxyCreate {
                remote_url: p.remote_url.clone(),
                username: p.username.clone(),
                password: p.password.clone(),
            }),
            volumes: r.volumes.clone(),
        }),
        use_: cfg.create_opts.registries.use_.clone(),
        config: cfg.create_opts.registries.config.clone(),
    };

    simple.options.k3c = K3cOptions {
        wait: cfg.create_opts.wait_for_ready,
        timeout: cfg
            .create_opts
            .timeout
            .map(|t| format!("{}s", t.as_secs())),
        disable_loadbalancer: cfg.create_opts.disable_load_balancer,
        disable_image_volume: cfg.create_opts.disable_image_volume,
        strict_hooks: cfg.create_opts.hook_failure_policy == HookFailurePolicy::Strict,
        node_wait_logs: cfg.create_opts.node_wait_logs,
    };
    simple.options.kubeconfig = KubeconfigOptions {
        update_default: cfg.kubeconfig_opts.update_default,
        switch_current_context: cfg.kubeconfig_opts.switch_current_context,
    };

    simple
}

/// Derived env keys that regenerate on transform and must not round-trip.
const DERIVED_ENV: [&str; 3] = ["K3S_TOKEN", "K3S_KUBECONFIG_OUTPUT", "K3S_URL"];

fn recover_node_scoped(cfg: &ClusterConfig, simple: &mut SimpleConfig) {
    let cluster = &cfg.cluster;
    let mut role_index: std::collections::HashMap<Role, usize> = std::collections::HashMap::new();

    for node in &cluster.nodes {
        let index = role_index.entry(node.role()).or_insert(0);
        let node_filter = match node.role() {
            Role::LoadBalancer => "loadbalancer".to_string(),
            role => format!("{}:{index}", role.as_str()),
        };
        *index += 1;

        for (key, value) in &node.spec.env {
            if DERIVED_ENV.contains(&key.as_str()) || key.starts_with("K3C_FIX_") {
                continue;
            }
            simple.env.push(EnvWithFilters {
                env_var: format!("{key}={value}"),
                node_filters: vec![node_filter.clone()],
            });
        }

        for volume in &node.spec.volumes {
            if Some(&volume.source) == cluster.image_volume.as_ref() {
                continue;
            }
            simple.volumes.push(VolumeWithFilters {
                volume: volume.to_string(),
                node_filters: vec![node_filter.clone()],
            });
        }

        for mapping in &node.spec.ports {
            if is_derived_port(cfg, node.role(), mapping) {
                continue;
            }
            if node.role() == Role::LoadBalancer {
                // already recovered through lb_extra_ports
                continue;
            }
            simple.ports.push(PortWithFilters {
                port: mapping.to_string(),
                node_filters: vec![node_filter.clone()],
            });
        }

        for arg in &node.spec.args {
            if arg == "--cluster-init" || arg.starts_with("--tls-san=") {
                continue;
            }
            simple.options.k3s.extra_args.push(ArgWithFilters {
                arg: arg.clone(),
                node_filters: vec![node_filter.clone()],
            });
        }

        for (key, value) in &node.spec.k3s_node_labels {
            simple.options.k3s.node_labels.push(LabelWithFilters {
                label: format!("{key}={value}"),
                node_filters: vec![node_filter.clone()],
            });
        }
    }
}

fn is_derived_port(cfg: &ClusterConfig, role: Role, mapping: &PortMapping) -> bool {
    let api = &cfg.cluster.kube_api;
    let is_api_binding = mapping.container_port == api.container_port
        && mapping.host_port == Some(api.host_port);
    match role {
        Role::LoadBalancer => is_api_binding,
        Role::Server => cfg.cluster.loadbalancer().is_none() && is_api_binding,
        _ => false,
    }
}
