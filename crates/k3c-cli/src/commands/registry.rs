//! `k3c registry` subcommands.

use clap::Subcommand;
use k3c_core::{RegistryManager, Result};
use k3c_types::{Registry, RegistryPort, NAME_PREFIX};
use tokio_util::sync::CancellationToken;

use super::runtime;

#[derive(Subcommand)]
pub enum RegistryCommand {
    /// Create a standalone registry.
    Create {
        /// Registry name; the `k3c-` prefix is added when missing.
        name: String,
        /// Host port to publish the registry on.
        #[arg(short, long)]
        port: Option<u16>,
        /// Registry image.
        #[arg(long, default_value = k3c_config::DEFAULT_REGISTRY_IMAGE)]
        image: String,
    },
    /// Delete a registry.
    Delete {
        /// Registry (container) name.
        name: String,
    },
    /// List registries.
    List,
}

pub async fn execute(command: RegistryCommand) -> Result<()> {
    let runtime = runtime();
    let registries = RegistryManager::new(runtime, k3c_core::EventBus::new());
    let cancel = CancellationToken::new();

    match command {
        RegistryCommand::Create { name, port, image } => {
            let name = if name.starts_with(&format!("{NAME_PREFIX}-")) {
                name
            } else {
                format!("{NAME_PREFIX}-{name}")
            };
            let registry = Registry {
                host: name.clone(),
                name,
                image,
                port: RegistryPort {
                    host_ip: None,
                    host_port: port,
                    container_port: k3c_types::REGISTRY_CONTAINER_PORT,
                },
                external: false,
                networks: Vec::new(),
                proxy: None,
                volumes: Vec::new(),
            };
            registries.create(&registry, None, &cancel).await?;
            println!("Created registry '{}'", registry.name);
            Ok(())
        }
        RegistryCommand::Delete { name } => {
            registries.delete(&name, &cancel).await?;
            println!("Deleted registry '{name}'");
            Ok(())
        }
        RegistryCommand::List => {
            let all = registries.list(&cancel).await?;
            println!("{:<28} {:<28} {:<10}", "NAME", "HOST", "EXTERNAL");
            for registry in all {
                println!(
                    "{:<28} {:<28} {:<10}",
                    registry.name, registry.host, registry.external
                );
            }
            Ok(())
        }
    }
}
