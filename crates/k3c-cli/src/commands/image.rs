//! `k3c image` subcommands.

use std::path::PathBuf;

use clap::Subcommand;
use k3c_core::Result;
use tokio_util::sync::CancellationToken;

use super::{manager, runtime};

#[derive(Subcommand)]
pub enum ImageCommand {
    /// Import images from the host into a cluster's nodes.
    Import {
        /// Image references to import (saved to a tar first) or a tar path.
        images: Vec<String>,
        /// Target cluster.
        #[arg(short, long, default_value = "default")]
        cluster: String,
    },
}

pub async fn execute(command: ImageCommand) -> Result<()> {
    match command {
        ImageCommand::Import { images, cluster } => {
            let cancel = CancellationToken::new();
            let manager = manager();

            // a single existing file is used as-is, otherwise the named
            // images are saved from the local daemon into a staging tar
            let staging;
            let tar: PathBuf = match images.as_slice() {
                [single] if std::path::Path::new(single).exists() => PathBuf::from(single),
                [] => {
                    return Err(k3c_core::CoreError::Common(
                        k3c_error::CommonError::config("no images given"),
                    ))
                }
                refs => {
                    staging = tempfile::NamedTempFile::new()
                        .map_err(|e| k3c_core::CoreError::Common(e.into()))?;
                    let path = staging.path().to_path_buf();
                    runtime()
                        .image_save(&refs.to_vec(), &path, &cancel)
                        .await?;
                    path
                }
            };

            manager.import_images(&cluster, &tar, &cancel).await?;
            println!("Imported into cluster '{cluster}'");
            Ok(())
        }
    }
}
