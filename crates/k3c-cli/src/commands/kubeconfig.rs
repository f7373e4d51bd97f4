//! `k3c kubeconfig` subcommands.

use clap::Subcommand;
use k3c_core::{kubeconfig, Result};
use tokio_util::sync::CancellationToken;

use super::{manager, runtime};

#[derive(Subcommand)]
pub enum KubeconfigCommand {
    /// Print a cluster's kubeconfig.
    Get {
        /// Cluster name.
        cluster: String,
    },
    /// Merge a cluster's kubeconfig into a file.
    Merge {
        /// Cluster name.
        cluster: String,
        /// Target file; defaults to `$KUBECONFIG` or `~/.kube/config`.
        #[arg(short, long)]
        output: Option<String>,
        /// Select the cluster's context as current.
        #[arg(long)]
        switch_context: bool,
    },
}

pub async fn execute(command: KubeconfigCommand) -> Result<()> {
    let cancel = CancellationToken::new();
    match command {
        KubeconfigCommand::Get { cluster } => {
            let cluster = manager().get(&cluster, &cancel).await?;
            let rendered = kubeconfig::fetch(&runtime(), &cluster, &cancel).await?;
            print!("{rendered}");
            Ok(())
        }
        KubeconfigCommand::Merge {
            cluster,
            output,
            switch_context,
        } => {
            let cluster_obj = manager().get(&cluster, &cancel).await?;
            let rendered = kubeconfig::fetch(&runtime(), &cluster_obj, &cancel).await?;

            let path = output
                .map(std::path::PathBuf::from)
                .or_else(kubeconfig::default_path)
                .ok_or_else(|| {
                    k3c_core::CoreError::Common(k3c_error::CommonError::config(
                        "no kubeconfig path given and none could be derived",
                    ))
                })?;
            kubeconfig::merge_into_file(&path, &rendered, switch_context)?;
            println!(
                "Wrote context '{}' to {}",
                kubeconfig::context_name(&cluster),
                path.display()
            );
            Ok(())
        }
    }
}
