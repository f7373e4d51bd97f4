//! Command definitions.

use clap::{Parser, Subcommand};

pub mod cluster;
pub mod image;
pub mod kubeconfig;
pub mod node;
pub mod registry;

use std::sync::Arc;

use k3c_core::ClusterManager;
use k3c_runtime::{DockerCli, DynRuntime};

/// k3s clusters in containers.
#[derive(Parser)]
#[command(name = "k3c", version, about = "Run multi-node k3s clusters as containers")]
pub struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage clusters.
    #[command(subcommand)]
    Cluster(cluster::ClusterCommand),
    /// Manage nodes of an existing cluster.
    #[command(subcommand)]
    Node(node::NodeCommand),
    /// Manage registries.
    #[command(subcommand)]
    Registry(registry::RegistryCommand),
    /// Manage kubeconfig entries.
    #[command(subcommand)]
    Kubeconfig(kubeconfig::KubeconfigCommand),
    /// Manage images in clusters.
    #[command(subcommand)]
    Image(image::ImageCommand),
    /// Print version information.
    Version,
}

/// Builds the orchestrator against the local Docker daemon.
pub(crate) fn manager() -> ClusterManager {
    let runtime: DynRuntime = Arc::new(DockerCli::new());
    ClusterManager::new(runtime)
}

/// Builds the bare runtime handle for commands that bypass the orchestrator.
pub(crate) fn runtime() -> DynRuntime {
    Arc::new(DockerCli::new())
}
