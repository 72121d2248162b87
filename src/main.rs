//! imgpull CLI entry point
//!
//! Pulls a container image from an OCI Distribution v2 registry into a
//! Docker-compatible tarball, or dumps loose manifests/blobs.

use clap::Parser;
use imgpull::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    imgpull::cli::run::execute(cli).await
}
