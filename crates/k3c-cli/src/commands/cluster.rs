//! `k3c cluster` subcommands.

use clap::{Args, Subcommand};
use k3c_config::{load_cluster_config, TransformEnv};
use k3c_core::{CoreError, Result};
use serde_yaml::{Mapping, Value};
use tokio_util::sync::CancellationToken;

use super::manager;

#[derive(Subcommand)]
pub enum ClusterCommand {
    /// Create a cluster.
    Create(CreateArgs),
    /// Delete a cluster and everything it owns.
    Delete {
        /// Cluster name.
        name: String,
    },
    /// List clusters.
    List,
    /// Start a stopped cluster.
    Start {
        /// Cluster name.
        name: String,
    },
    /// Stop a running cluster.
    Stop {
        /// Cluster name.
        name: String,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Cluster name.
    #[arg(default_value = "default")]
    pub name: String,
    /// Config file (YAML, apiVersion k3c.io/v1alpha2 through v1alpha5).
    #[arg(short, long)]
    pub config: Option<String>,
    /// Number of server nodes.
    #[arg(short, long)]
    pub servers: Option<u32>,
    /// Number of agent nodes.
    #[arg(short, long)]
    pub agents: Option<u32>,
    /// k3s image.
    #[arg(short, long)]
    pub image: Option<String>,
    /// Join an existing network instead of creating one.
    #[arg(long)]
    pub network: Option<String>,
    /// Cluster-join token.
    #[arg(long)]
    pub token: Option<String>,
    /// Host port for the Kube API.
    #[arg(long)]
    pub api_port: Option<u16>,
    /// Publish a port, docker syntax plus node filter: `8080:80@loadbalancer`.
    #[arg(short, long = "port")]
    pub ports: Vec<String>,
    /// Mount a volume, docker syntax plus node filter: `/src:/dst@agent:0`.
    #[arg(short, long = "volume")]
    pub volumes: Vec<String>,
    /// Set an env var on nodes: `KEY=VALUE@server:*`.
    #[arg(short, long = "env")]
    pub env: Vec<String>,
    /// Overall timeout, e.g. `120s`.
    #[arg(long)]
    pub timeout: Option<String>,
    /// Do not wait for the cluster to be ready.
    #[arg(long)]
    pub no_wait: bool,
    /// Do not create a load balancer in front of the servers.
    #[arg(long)]
    pub no_lb: bool,
    /// Do not create the image volume.
    #[arg(long)]
    pub no_image_volume: bool,
    /// Do not touch the default kubeconfig.
    #[arg(long)]
    pub no_kubeconfig_update: bool,
}

pub async fn execute(command: ClusterCommand) -> Result<()> {
    match command {
        ClusterCommand::Create(args) => create(args).await,
        ClusterCommand::Delete { name } => {
            let manager = manager();
            manager.delete(&name, &CancellationToken::new()).await?;
            if let Some(path) = k3c_core::kubeconfig::default_path() {
                let _ = k3c_core::kubeconfig::remove_from_file(&path, &name);
            }
            println!("Deleted cluster '{name}'");
            Ok(())
        }
        ClusterCommand::List => {
            let manager = manager();
            let clusters = manager.list(&CancellationToken::new()).await?;
            println!("{:<20} {:>8} {:>8} {:>14}", "NAME", "SERVERS", "AGENTS", "LOADBALANCER");
            for cluster in clusters {
                println!(
                    "{:<20} {:>8} {:>8} {:>14}",
                    cluster.name,
                    cluster.server_count(),
                    cluster.agent_count(),
                    if cluster.loadbalancer().is_some() { "true" } else { "false" },
                );
            }
            Ok(())
        }
        ClusterCommand::Start { name } => {
            manager().start(&name, &CancellationToken::new()).await?;
            println!("Started cluster '{name}'");
            Ok(())
        }
        ClusterCommand::Stop { name } => {
            manager().stop(&name, &CancellationToken::new()).await?;
            println!("Stopped cluster '{name}'");
            Ok(())
        }
    }
}

async fn create(args: CreateArgs) -> Result<()> {
    // thin loader boundary: read YAML into a value tree, hand it to the
    // pipeline together with the flag overrides
    let primary = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| CoreError::Common(e.into()))?;
            serde_yaml::from_str(&raw)
                .map_err(|e| CoreError::Config(k3c_config::ConfigError::Parse(e)))?
        }
        None => minimal_document(&args.name),
    };
    let overrides = flag_overrides(&args);

    let cfg = load_cluster_config(primary, Vec::new(), overrides, &TransformEnv::from_env())?;
    let name = cfg.cluster.name.clone();

    let manager = manager();
    let cluster = manager.create(cfg, &CancellationToken::new()).await?;

    println!(
        "Cluster '{name}' ready: {} server(s), {} agent(s)",
        cluster.server_count(),
        cluster.agent_count()
    );
    println!("Run `kubectl config use-context k3c-{name}` to use it");
    Ok(())
}

fn minimal_document(name: &str) -> Value {
    let mut metadata = Mapping::new();
    metadata.insert(Value::from("name"), Value::from(name));
    let mut doc = Mapping::new();
    doc.insert(
        Value::from("apiVersion"),
        Value::from(k3c_config::API_VERSION_CURRENT),
    );
    doc.insert(Value::from("kind"), Value::from(k3c_config::KIND_SIMPLE));
    doc.insert(Value::from("metadata"), Value::Mapping(metadata));
    Value::Mapping(doc)
}

/// Builds the highest-precedence merge source from explicit flags.
fn flag_overrides(args: &CreateArgs) -> Option<Value> {
    let mut doc = Mapping::new();

    let mut metadata = Mapping::new();
    metadata.insert(Value::from("name"), Value::from(args.name.as_str()));
    doc.insert(Value::from("metadata"), Value::Mapping(metadata));

    if let Some(servers) = args.servers {
        doc.insert(Value::from("servers"), Value::from(servers));
    }
    if let Some(agents) = args.agents {
        doc.insert(Value::from("agents"), Value::from(agents));
    }
    if let Some(image) = &args.image {
        doc.insert(Value::from("image"), Value::from(image.as_str()));
    }
    if let Some(network) = &args.network {
        doc.insert(Value::from("network"), Value::from(network.as_str()));
    }
    if let Some(token) = &args.token {
        doc.insert(Value::from("token"), Value::from(token.as_str()));
    }
    if let Some(port) = args.api_port {
        let mut kube_api = Mapping::new();
        kube_api.insert(Value::from("hostPort"), Value::from(port));
        doc.insert(Value::from("kubeAPI"), Value::Mapping(kube_api));
    }

    if !args.ports.is_empty() {
        doc.insert(
            Value::from("ports"),
            scoped_list(&args.ports, "port"),
        );
    }
    if !args.volumes.is_empty() {
        doc.insert(
            Value::from("volumes"),
            scoped_list(&args.volumes, "volume"),
        );
    }
    if !args.env.is_empty() {
        doc.insert(Value::from("env"), scoped_list(&args.env, "envVar"));
    }

    let mut k3c = Mapping::new();
    if args.no_wait {
        k3c.insert(Value::from("wait"), Value::from(false));
    }
    if let Some(timeout) = &args.timeout {
        k3c.insert(Value::from("timeout"), Value::from(timeout.as_str()));
    }
    if args.no_lb {
        k3c.insert(Value::from("disableLoadbalancer"), Value::from(true));
    }
    if args.no_image_volume {
        k3c.insert(Value::from("disableImageVolume"), Value::from(true));
    }
    let mut options = Mapping::new();
    if !k3c.is_empty() {
        options.insert(Value::from("k3c"), Value::Mapping(k3c));
    }
    if args.no_kubeconfig_update {
        let mut kubeconfig = Mapping::new();
        kubeconfig.insert(Value::from("updateDefault"), Value::from(false));
        kubeconfig.insert(Value::from("switchCurrentContext"), Value::from(false));
        options.insert(Value::from("kubeconfig"), Value::Mapping(kubeconfig));
    }
    if !options.is_empty() {
        doc.insert(Value::from("options"), Value::Mapping(options));
    }

    Some(Value::Mapping(doc))
}

/// Splits `value@filter1;filter2` flag entries into scoped list records.
fn scoped_list(entries: &[String], value_key: &str) -> Value {
    let records = entries
        .iter()
        .map(|entry| {
            let (value, filters) = match entry.split_once('@') {
                Some((value, filters)) => (
                    value,
                    filters
                        .split(';')
                        .filter(|f| !f.is_empty())
                        .map(Value::from)
                        .collect(),
                ),
                None => (entry.as_str(), Vec::new()),
            };
            let mut record = Mapping::new();
            record.insert(Value::from(value_key), Value::from(value));
            record.insert(Value::from("nodeFilters"), Value::Sequence(filters));
            Value::Mapping(record)
        })
        .collect();
    Value::Sequence(records)
}
