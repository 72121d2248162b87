//! Thin CLI surface: flag parsing, TLS
//! client construction, and dispatch into the `Puller` core.

pub mod run;

use clap::Parser;

/// imgpull - pull container images from an OCI Distribution v2 registry
#[derive(Parser)]
#[command(name = "imgpull")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Image reference, e.g. docker.io/library/alpine:latest
    pub image_ref: String,

    /// Output tarball path (mutually exclusive with --manifest)
    pub tar_file: Option<String>,

    /// Write loose manifest and blob files into this directory instead of
    /// a tarball (mutually exclusive with tarFile and --manifest)
    #[arg(long, conflicts_with = "tar_file")]
    pub dir: Option<String>,

    /// Platform OS to select from a multi-platform index
    #[arg(long)]
    pub os: Option<String>,

    /// Platform architecture to select from a multi-platform index
    #[arg(long)]
    pub arch: Option<String>,

    /// Pull-through namespace (upstream registry to resolve cache misses from)
    #[arg(long)]
    pub ns: Option<String>,

    /// Username for Basic auth
    #[arg(long)]
    pub user: Option<String>,

    /// Password for Basic auth
    #[arg(long)]
    pub password: Option<String>,

    /// Scheme to use when contacting the registry
    #[arg(long, default_value = "https")]
    pub scheme: String,

    /// Client certificate for mTLS
    #[arg(long)]
    pub cert: Option<String>,

    /// Client key for mTLS
    #[arg(long)]
    pub key: Option<String>,

    /// CA certificate bundle to trust
    #[arg(long)]
    pub cacert: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Print a manifest instead of pulling a tarball: "image" or "list".
    /// Mutually exclusive with tarFile.
    #[arg(long, value_parser = ["image", "list"], conflicts_with = "tar_file")]
    pub manifest: Option<String>,
}
