//! `imgpull` execution glue: turn parsed flags into a `Puller` and dispatch.

use crate::cli::Cli;
use crate::puller::{ManifestKind, Puller, PullerOpts};
use anyhow::{Context, Result};
use tracing::info;

/// Build the HTTP client per the CLI's TLS flags. The `Puller` core never
/// parses PEM itself — it takes an already-built `reqwest::Client`.
fn build_client(cli: &Cli) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(format!("imgpull/{}", crate::VERSION))
        .danger_accept_invalid_certs(cli.insecure);

    if let (Some(cert_path), Some(key_path)) = (&cli.cert, &cli.key) {
        let mut pem = std::fs::read(cert_path)
            .with_context(|| format!("reading client certificate {cert_path}"))?;
        let mut key = std::fs::read(key_path)
            .with_context(|| format!("reading client key {key_path}"))?;
        pem.append(&mut key);
        let identity = reqwest::Identity::from_pem(&pem)
            .context("building client identity from cert/key")?;
        builder = builder.identity(identity);
    }

    if let Some(ca_path) = &cli.cacert {
        let ca_bytes =
            std::fs::read(ca_path).with_context(|| format!("reading CA bundle {ca_path}"))?;
        let ca = reqwest::Certificate::from_pem(&ca_bytes).context("parsing CA bundle")?;
        builder = builder.add_root_certificate(ca);
    }

    Ok(builder.build()?)
}

pub async fn execute(cli: Cli) -> Result<()> {
    let opts = PullerOpts {
        url: cli.image_ref.clone(),
        scheme: cli.scheme.clone(),
        os: cli.os.clone().unwrap_or_else(|| default_os().to_string()),
        arch: cli.arch.clone().unwrap_or_else(default_arch),
        username: cli.user.clone(),
        password: cli.password.clone(),
        namespace: cli.ns.clone(),
        insecure: cli.insecure,
        ..PullerOpts::default()
    };

    let client = build_client(&cli)?;
    let puller = Puller::with_client(opts, client)?;

    if let Some(kind) = &cli.manifest {
        let kind = match kind.as_str() {
            "list" => ManifestKind::ImageList,
            _ => ManifestKind::Image,
        };
        let holder = puller.pull_manifest(kind).await?;
        println!("{}", holder.variant.to_json_string()?);
        return Ok(());
    }

    if let Some(dir) = &cli.dir {
        std::fs::create_dir_all(dir)?;
        let holder = puller.pull_to_dir(std::path::Path::new(dir)).await?;
        info!(digest = %holder.digest, "pulled manifest and blobs");
        println!(
            "Wrote manifest and blobs for {} to {}",
            puller.image_ref().url_with_ns(),
            dir
        );
        return Ok(());
    }

    let tar_path = cli
        .tar_file
        .clone()
        .unwrap_or_else(|| default_tar_name(&cli.image_ref));
    puller.pull_tar(std::path::Path::new(&tar_path)).await?;
    println!("{}", tar_path);
    Ok(())
}

fn default_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn default_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
    .to_string()
}

fn default_tar_name(image_ref: &str) -> String {
    let sanitized: String = image_ref
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{sanitized}.tar")
}
