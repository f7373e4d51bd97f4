//! `k3c node` subcommands.

use clap::Subcommand;
use k3c_core::Result;
use k3c_types::Role;
use tokio_util::sync::CancellationToken;

use super::manager;

#[derive(Subcommand)]
pub enum NodeCommand {
    /// Add a node to an existing cluster.
    Create {
        /// Cluster to grow.
        #[arg(short, long)]
        cluster: String,
        /// Role of the new node.
        #[arg(long, default_value = "agent", value_parser = parse_role)]
        role: Role,
    },
    /// Remove a node from its cluster.
    Delete {
        /// Node (container) name.
        name: String,
    },
    /// List the nodes of a cluster.
    List {
        /// Cluster name.
        cluster: String,
    },
}

fn parse_role(raw: &str) -> std::result::Result<Role, String> {
    match raw {
        "server" => Ok(Role::Server),
        "agent" => Ok(Role::Agent),
        other => Err(format!("role must be 'server' or 'agent', got '{other}'")),
    }
}

pub async fn execute(command: NodeCommand) -> Result<()> {
    let manager = manager();
    match command {
        NodeCommand::Create { cluster, role } => {
            let name = manager
                .add_node(&cluster, role, &CancellationToken::new())
                .await?;
            println!("Added node '{name}' to cluster '{cluster}'");
            Ok(())
        }
        NodeCommand::Delete { name } => {
            manager.delete_node(&name, &CancellationToken::new()).await?;
            println!("Deleted node '{name}'");
            Ok(())
        }
        NodeCommand::List { cluster } => {
            let cluster = manager.get(&cluster, &CancellationToken::new()).await?;
            println!("{:<28} {:<14} {:<10} {:<16}", "NAME", "ROLE", "STATE", "IP");
            for node in &cluster.nodes {
                println!(
                    "{:<28} {:<14} {:<10} {:<16}",
                    node.name(),
                    node.role(),
                    node.status.state,
                    node.status.ip.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}
