//! Load balancer configuration synthesis and delivery.
//!
//! The proxy container fronting the server API is driven entirely from
//! here: synthesis is a pure function of current membership and the desired
//! port map, delivery is copy-then-reload with a digest short-circuit. No
//! other component writes LB configuration.

use std::time::Duration;

use k3c_runtime::DynRuntime;
use k3c_types::{Cluster, PortMapping, Role};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Path of the proxy configuration inside the LB container.
pub const LB_CONFIG_PATH: &str = "/etc/nginx/nginx.conf";
/// Default upstream timeout written into the configuration.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Synthesizes the proxy configuration document.
///
/// Pure function of `(members, ports)`: the API port proxies to the servers
/// in index order, each extra port proxies to every k3s node in node order.
/// Byte-identical inputs produce byte-identical output.
#[must_use]
pub fn synthesize_config(
    cluster: &Cluster,
    extra_ports: &[PortMapping],
    upstream_timeout: Duration,
) -> String {
    let mut doc = String::new();
    doc.push_str("worker_processes auto;\n");
    doc.push_str("events {\n    worker_connections 1024;\n}\n");
    doc.push_str("stream {\n");

    let api_port = cluster.kube_api.container_port;
    let servers: Vec<&str> = cluster
        .nodes_by_role(Role::Server)
        .map(|n| n.name())
        .collect();
    push_proxy(&mut doc, api_port, api_port, &servers, upstream_timeout);

    let k3s_nodes: Vec<&str> = cluster
        .nodes
        .iter()
        .filter(|n| n.role().is_k3s())
        .map(|n| n.name())
        .collect();
    for mapping in extra_ports {
        let listen = mapping.host_port.unwrap_or(mapping.container_port);
        push_proxy(
            &mut doc,
            listen,
            mapping.container_port,
            &k3s_nodes,
            upstream_timeout,
        );
    }

    doc.push_str("}\n");
    doc
}

fn push_proxy(
    doc: &mut String,
    listen: u16,
    target: u16,
    backends: &[&str],
    timeout: Duration,
) {
    doc.push_str(&format!("    upstream port_{listen} {{\n"));
    for backend in backends {
        doc.push_str(&format!(
            "        server {backend}:{target} max_fails=1 fail_timeout=10s;\n"
        ));
    }
    doc.push_str("    }\n");
    doc.push_str(&format!(
        "    server {{\n        listen {listen};\n        proxy_pass port_{listen};\n        proxy_timeout {}s;\n    }}\n",
        timeout.as_secs()
    ));
}

/// Delivers configuration into the LB container and keeps it current.
pub struct LoadBalancer {
    runtime: DynRuntime,
    last_digest: Mutex<Option<[u8; 32]>>,
}

impl LoadBalancer {
    /// Creates a synthesizer bound to a runtime.
    #[must_use]
    pub fn new(runtime: DynRuntime) -> Self {
        Self {
            runtime,
            last_digest: Mutex::new(None),
        }
    }

    /// Writes the initial configuration into a created (not yet started) LB
    /// container so the proxy has upstreams on first start. The delivery is
    /// not recorded: the first [`LoadBalancer::sync`] after start delivers
    /// again and reloads, and that reload's exit code is the LB readiness
    /// criterion.
    pub async fn install(
        &self,
        cluster: &Cluster,
        extra_ports: &[PortMapping],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(lb) = cluster.loadbalancer() else {
            return Ok(());
        };
        let doc = synthesize_config(cluster, extra_ports, DEFAULT_UPSTREAM_TIMEOUT);
        self.runtime
            .copy_to_container(lb.name(), LB_CONFIG_PATH, doc.as_bytes(), 0o644, cancel)
            .await?;
        debug!(node = lb.name(), "installed initial LB config");
        Ok(())
    }

    /// Synchronizes the running LB with current membership.
    ///
    /// Returns true when a new document was delivered and reloaded, false
    /// when the configuration was already current.
    pub async fn sync(
        &self,
        cluster: &Cluster,
        extra_ports: &[PortMapping],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(lb) = cluster.loadbalancer() else {
            return Ok(false);
        };

        let doc = synthesize_config(cluster, extra_ports, DEFAULT_UPSTREAM_TIMEOUT);
        let digest: [u8; 32] = Sha256::digest(doc.as_bytes()).into();

        let mut last = self.last_digest.lock().await;
        if *last == Some(digest) {
            debug!(node = lb.name(), "LB config unchanged");
            return Ok(false);
        }

        self.runtime
            .copy_to_container(lb.name(), LB_CONFIG_PATH, doc.as_bytes(), 0o644, cancel)
            .await?;

        let reload = vec![
            "sh".to_string(),
            "-c".to_string(),
            "nginx -s reload".to_string(),
        ];
        let result = self.runtime.exec(lb.name(), &reload, cancel).await?;
        if !result.success() {
            return Err(CoreError::LbReloadFailed {
                status: result.exit_code,
                stderr: result.stderr,
            });
        }

        *last = Some(digest);
        info!(node = lb.name(), "LB config delivered and reloaded");
        Ok(true)
    }
}
