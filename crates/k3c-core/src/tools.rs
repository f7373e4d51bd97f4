//! Ephemeral tools helper container.
//!
//! A short-lived container joined to the cluster network, used for host IP
//! discovery on VM-backed runtimes, tar image imports into cluster nodes
//! and ad-hoc exec probes. Singleton per cluster operation.

use std::net::IpAddr;
use std::path::Path;

use k3c_runtime::{DynRuntime, ExecResult, RuntimeKind};
use k3c_types::{labels, tools_name, Cluster, NodeSpec, Role};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::node::NodeManager;

/// Where image tars land inside nodes before import.
const IMPORT_STAGING_PATH: &str = "/tmp/k3c-import.tar";

/// The per-cluster helper container.
pub struct ToolsNode {
    runtime: DynRuntime,
    nodes: NodeManager,
    name: String,
}

impl ToolsNode {
    /// Creates and starts the helper on the cluster's network.
    pub async fn ensure(
        runtime: DynRuntime,
        nodes: NodeManager,
        cluster: &Cluster,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let name = tools_name(cluster.name.as_str());
        let mut spec = NodeSpec::new(name.clone(), Role::Tools, image);
        spec.networks.push(cluster.network.name.clone());
        spec.runtime_labels = labels::standard(
            cluster.name.as_str(),
            Role::Tools,
            &cluster.kube_api.url(),
            &cluster.token,
        );
        // keep the container alive until we remove it
        spec.cmd = vec!["sleep".to_string(), "infinity".to_string()];

        nodes.create(&spec, cancel).await?;
        nodes.start(&spec, cancel).await?;
        debug!(node = %name, "tools helper running");

        Ok(Self {
            runtime,
            nodes,
            name,
        })
    }

    /// Discovers the host address reachable from inside the cluster
    /// network. Needed to fill `K3S_URL`-style references when the runtime
    /// daemon is VM-backed and the host is not on the container network.
    pub async fn host_ip(
        &self,
        cluster: &Cluster,
        cancel: &CancellationToken,
    ) -> Result<Option<IpAddr>> {
        let info = self.runtime.host_info(cancel).await?;
        if info.kind == RuntimeKind::Native {
            // the network gateway is the host itself
            return self
                .runtime
                .host_gateway_ip(&cluster.network.name, cancel)
                .await
                .map_err(Into::into);
        }

        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "getent hosts host.docker.internal | awk '{print $1}'".to_string(),
        ];
        let result = self.runtime.exec(&self.name, &cmd, cancel).await?;
        let parsed = result.stdout.trim().parse().ok();
        if parsed.is_none() {
            warn!("could not resolve host address from inside the network");
        }
        Ok(parsed)
    }

    /// Imports a tar of images into the given k3s nodes.
    ///
    /// The archive is staged into each node and loaded through the embedded
    /// containerd.
    pub async fn import_images(
        &self,
        cluster: &Cluster,
        tar: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let content = std::fs::read(tar)
            .map_err(|e| crate::error::CoreError::Common(e.into()))?;

        for node in cluster.nodes.iter().filter(|n| n.role().is_k3s()) {
            self.runtime
                .copy_to_container(node.name(), IMPORT_STAGING_PATH, &content, 0o644, cancel)
                .await?;
            let cmd = vec![
                "ctr".to_string(),
                "image".to_string(),
                "import".to_string(),
                IMPORT_STAGING_PATH.to_string(),
            ];
            let result = self.runtime.exec(node.name(), &cmd, cancel).await?;
            if !result.success() {
                return Err(crate::error::CoreError::Hook {
                    node: node.name().to_string(),
                    description: "import images".to_string(),
                    message: result.stderr,
                });
            }
            info!(node = node.name(), "images imported");
        }
        Ok(())
    }

    /// Runs an arbitrary probe command inside the helper.
    pub async fn probe(&self, cmd: &[String], cancel: &CancellationToken) -> Result<ExecResult> {
        self.runtime
            .exec(&self.name, cmd, cancel)
            .await
            .map_err(Into::into)
    }

    /// Removes the helper container.
    pub async fn remove(self, cancel: &CancellationToken) -> Result<()> {
        self.nodes.delete(&self.name, cancel).await
    }
}
