//! Command-line front end over the converter library.
//!
//! Thin by design: parse arguments, build a `Converter`, run one library
//! operation, print the result as JSON.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use diskforge::{
    ConvertRequest, Converter, DEFAULT_DISK_SIZE_MB, FilesystemKind, RuntimeOptions,
};

#[derive(Parser)]
#[command(name = "diskforge", version, about = "Convert container filesystems into bootable disk images")]
struct Cli {
    /// Runtime home directory (images/, staging/, mounts/, logs/).
    /// Defaults to DISKFORGE_HOME, then ~/.diskforge.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert an exported container filesystem into a bootable image.
    Convert {
        /// Exported tree directory or `docker export` tarball (tar/tar.gz).
        source: String,

        /// Output image path. Relative paths land in the images directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Disk size in MiB.
        #[arg(long, default_value_t = DEFAULT_DISK_SIZE_MB)]
        size_mb: u64,

        /// Root partition filesystem (ext2, ext3, ext4).
        #[arg(long, default_value_t = FilesystemKind::Ext4)]
        filesystem: FilesystemKind,

        /// Replace an existing file at the output path.
        #[arg(long)]
        overwrite: bool,
    },

    /// List finished images in the runtime images directory.
    List,

    /// Remove all finished images and manifests.
    Cleanup,
}

#[derive(Serialize)]
struct CleanupReport {
    removed: u64,
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = RuntimeOptions::default();
    if let Some(home) = cli.home {
        options.home_dir = home;
    }
    let converter = Converter::new(options).context("failed to initialize converter")?;

    match cli.command {
        Command::Convert {
            source,
            output,
            size_mb,
            filesystem,
            overwrite,
        } => {
            let mut request = ConvertRequest::new(source);
            request.output = output;
            request.size_mb = size_mb;
            request.filesystem = filesystem;
            request.overwrite = overwrite;

            let result = converter.convert(request).await?;
            print_json(&result)?;
            if !result.succeeded() {
                std::process::exit(1);
            }
        }
        Command::List => {
            let entries = converter.list_artifacts().await?;
            print_json(&entries)?;
        }
        Command::Cleanup => {
            let removed = converter.cleanup_artifacts().await?;
            let message = if removed == 0 {
                "no files to clean up".to_string()
            } else {
                format!("removed {} image(s)", removed)
            };
            print_json(&CleanupReport { removed, message })?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
