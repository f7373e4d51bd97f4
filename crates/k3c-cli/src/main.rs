//! k3c CLI - k3s clusters in containers.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "k3c=debug" } else { "k3c=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = match cli.command {
        Commands::Cluster(cmd) => commands::cluster::execute(cmd).await,
        Commands::Node(cmd) => commands::node::execute(cmd).await,
        Commands::Registry(cmd) => commands::registry::execute(cmd).await,
        Commands::Kubeconfig(cmd) => commands::kubeconfig::execute(cmd).await,
        Commands::Image(cmd) => commands::image::execute(cmd).await,
        Commands::Version => {
            println!("k3c version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}
