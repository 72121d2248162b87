//! Pull orchestrator
//!
//! `Puller` owns `PullerOpts`, the parsed `ImageRef`, the HTTP client, and
//! auth state. `RegistryClient` is a transient view constructed per
//! operation that borrows these — it never outlives the `Puller`.

use crate::auth::{self, AuthState, Challenge};
use crate::coordinator::BlobCoordinator;
use crate::digest::{self, BlobStore};
use crate::manifest::{Layer, ManifestHolder};
use crate::reference::ImageRef;
use crate::registry::RegistryClient;
use crate::tarball::{self, ImageTarball};
use crate::{PullError, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Which flavor of manifest the caller wants out of `pull_manifest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// The raw index/list, failing if the server only has a single image.
    ImageList,
    /// A single platform image, resolving an index/list if the server gave one.
    Image,
}

/// Configuration for a `Puller`.
#[derive(Debug, Clone)]
pub struct PullerOpts {
    pub url: String,
    pub scheme: String,
    pub os: String,
    pub arch: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: Option<String>,
    pub insecure: bool,
    pub max_idle_conns_per_host: usize,
}

impl Default for PullerOpts {
    fn default() -> Self {
        PullerOpts {
            url: String::new(),
            scheme: "https".to_string(),
            os: default_os().to_string(),
            arch: default_arch().to_string(),
            username: None,
            password: None,
            namespace: None,
            insecure: false,
            max_idle_conns_per_host: 32,
        }
    }
}

fn default_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn default_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Shared construction-time checks for every `Puller` constructor.
fn validate_opts(opts: &PullerOpts) -> Result<()> {
    if opts.url.trim().is_empty() {
        return Err(PullError::InvalidOptions("url must not be empty".into()));
    }
    if opts.scheme != "http" && opts.scheme != "https" {
        return Err(PullError::InvalidOptions(format!(
            "unsupported scheme: {}",
            opts.scheme
        )));
    }
    validate_platform(&opts.os, &opts.arch)
}

/// Drives the full pull (connect -> manifest -> platform select -> blobs ->
/// assemble). Not `Sync` across pullers by design — auth state is scoped to
/// one puller.
#[derive(Debug)]
pub struct Puller {
    opts: PullerOpts,
    image_ref: ImageRef,
    client: reqwest::Client,
    auth: OnceCell<AuthState>,
    coordinator: Arc<BlobCoordinator>,
}

impl Puller {
    pub fn new(opts: PullerOpts) -> Result<Self> {
        Self::with_coordinator(opts, Arc::new(BlobCoordinator::default()))
    }

    /// Construct a puller that shares a coordinator with other pullers, so
    /// concurrent workers pulling overlapping blobs single-flight across
    /// images, not just within one pull.
    pub fn with_coordinator(opts: PullerOpts, coordinator: Arc<BlobCoordinator>) -> Result<Self> {
        validate_opts(&opts)?;

        let image_ref = ImageRef::parse(&opts.url, &opts.scheme, opts.namespace.as_deref())?;

        // Transports are cloned from a default prototype rather than
        // mutated in place, so TLS config from one puller never leaks into
        // another sharing the same process.
        let client = reqwest::Client::builder()
            .user_agent(format!("imgpull/{}", crate::VERSION))
            .pool_max_idle_per_host(opts.max_idle_conns_per_host)
            .danger_accept_invalid_certs(opts.insecure)
            .build()?;

        Ok(Puller {
            opts,
            image_ref,
            client,
            auth: OnceCell::new(),
            coordinator,
        })
    }

    /// Build a puller around an already-constructed HTTP client (e.g. one
    /// carrying a client certificate/CA bundle assembled by the CLI).
    pub fn with_client(opts: PullerOpts, client: reqwest::Client) -> Result<Self> {
        validate_opts(&opts)?;

        let image_ref = ImageRef::parse(&opts.url, &opts.scheme, opts.namespace.as_deref())?;
        Ok(Puller {
            opts,
            image_ref,
            client,
            auth: OnceCell::new(),
            coordinator: Arc::new(BlobCoordinator::default()),
        })
    }

    pub fn image_ref(&self) -> &ImageRef {
        &self.image_ref
    }

    fn registry(&self) -> RegistryClient<'_> {
        RegistryClient::new(&self.client, &self.image_ref, self.auth.get())
    }

    /// Anonymous -> Probed -> Authenticated|Denied. Idempotent: a second
    /// call on an already-authenticated puller returns immediately.
    pub async fn connect(&self) -> Result<()> {
        if self.auth.get().is_some() {
            return Ok(());
        }
        let registry = self.registry();
        let (status, challenges) = registry.v2_ping().await?;

        if status.is_success() {
            let _ = self.auth.set(AuthState::None);
            return Ok(());
        }
        if status != reqwest::StatusCode::UNAUTHORIZED && status != reqwest::StatusCode::FORBIDDEN
        {
            return Err(PullError::AuthFailed(status));
        }

        for header in &challenges {
            match auth::parse_challenge(header) {
                Challenge::Bearer { realm, service } => {
                    let token = registry.v2_bearer(&realm, &service).await?;
                    let _ = self.auth.set(AuthState::Bearer(token));
                    return Ok(());
                }
                Challenge::Basic => {
                    let (user, pass) = (
                        self.opts.username.as_deref().unwrap_or(""),
                        self.opts.password.as_deref().unwrap_or(""),
                    );
                    let encoded = auth::basic_credentials(user, pass);
                    registry.v2_basic(&encoded).await?;
                    let _ = self.auth.set(AuthState::Basic(encoded));
                    return Ok(());
                }
                Challenge::Other(_) => continue,
            }
        }

        Err(PullError::MalformedAuthHeader(
            "no supported WWW-Authenticate scheme offered".into(),
        ))
    }

    /// Fetch a manifest, resolving through an index/list for `ManifestKind::Image`.
    pub async fn pull_manifest(&self, kind: ManifestKind) -> Result<ManifestHolder> {
        self.connect().await?;
        let holder = self.registry().v2_get_manifest(None).await?;

        match kind {
            ManifestKind::ImageList => {
                if holder.is_manifest_list() {
                    Ok(holder)
                } else {
                    Err(PullError::NoImageList)
                }
            }
            ManifestKind::Image => {
                if holder.is_manifest_list() {
                    self.resolve_platform_manifest(&holder).await
                } else {
                    Ok(holder)
                }
            }
        }
    }

    async fn resolve_platform_manifest(&self, index: &ManifestHolder) -> Result<ManifestHolder> {
        let digest = index
            .variant
            .image_digest_for(&self.opts.os, &self.opts.arch)?;
        self.registry().v2_get_manifest(Some(&digest)).await
    }

    /// `HEAD` the manifest directly.
    pub async fn head_manifest(&self) -> Result<(crate::manifest::MediaKind, String, u64)> {
        self.connect().await?;
        self.registry().v2_head_manifest().await
    }

    /// Fetch every layer (including the config descriptor) of `holder` into `dir`.
    pub async fn pull_blobs(&self, holder: &ManifestHolder, dir: &Path) -> Result<()> {
        let store = BlobStore::new(dir);
        for (idx, layer) in holder.layers()?.iter().enumerate() {
            info!(
                layer = idx + 1,
                digest = %layer.digest,
                "pulling blob"
            );
            self.pull_one_blob(&store, layer).await?;
        }
        Ok(())
    }

    async fn pull_one_blob(&self, store: &BlobStore, layer: &Layer) -> Result<()> {
        let bare = digest::digest_from(&layer.digest).ok_or_else(|| {
            PullError::InvalidOptions(format!("malformed layer digest: {}", layer.digest))
        })?;
        let dest = store.path_for(&bare);
        let layer = layer.clone();
        let registry = self.registry();
        self.coordinator
            .run(&bare, || async move { registry.v2_get_blob(&layer, &dest).await })
            .await
    }

    /// connect -> manifest -> (index resolution) -> per-layer blobs, into
    /// the caller-supplied `blob_dir`. Returns an `ImageTarball` describing
    /// what was fetched, ready for `tarball::assemble`.
    pub async fn pull(&self, blob_dir: &Path) -> Result<ImageTarball> {
        self.connect().await?;
        let mut holder = self.registry().v2_get_manifest(None).await?;
        if holder.is_manifest_list() {
            holder = self.resolve_platform_manifest(&holder).await?;
        }

        self.pull_blobs(&holder, blob_dir).await?;

        let config = holder.config()?;
        let config_digest = digest::digest_from(&config.digest).ok_or_else(|| {
            PullError::InvalidOptions("malformed config digest in manifest".into())
        })?;
        let layers = holder
            .layers()?
            .into_iter()
            .filter(|l| l.digest != config.digest)
            .collect();

        Ok(ImageTarball {
            source_dir: blob_dir.to_path_buf(),
            image_url: holder.image_url.clone(),
            config_digest,
            layers,
        })
    }

    /// Pull into a scoped temporary directory and assemble a tarball at
    /// `dest_path`. The temp directory is always released, on every path.
    pub async fn pull_tar(&self, dest_path: &Path) -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let tarball = self.pull(tmp.path()).await?;
        tarball::assemble(&tarball, dest_path)?;
        Ok(())
    }

    /// Pull manifest + blobs to a caller-owned directory without building a
    /// tarball, leaving loose manifest + blob files behind.
    pub async fn pull_to_dir(&self, dir: &Path) -> Result<ManifestHolder> {
        self.connect().await?;
        let mut holder = self.registry().v2_get_manifest(None).await?;
        if holder.is_manifest_list() {
            holder = self.resolve_platform_manifest(&holder).await?;
        }
        self.pull_blobs(&holder, dir).await?;
        tokio::fs::write(dir.join("manifest.json"), &holder.raw).await?;
        Ok(holder)
    }
}

/// Validate an os/arch pair against the closed set of GOOS/GOARCH
/// combinations this client knows how to select. Exposed separately from
/// `Puller` construction so callers can validate flags before doing
/// anything else, but every `Puller` constructor also runs it via
/// `validate_opts`.
pub fn validate_platform(os: &str, arch: &str) -> Result<()> {
    const KNOWN: &[(&str, &str)] = &[
        ("linux", "amd64"),
        ("linux", "arm64"),
        ("linux", "arm"),
        ("linux", "386"),
        ("linux", "ppc64le"),
        ("linux", "s390x"),
        ("linux", "riscv64"),
        ("darwin", "amd64"),
        ("darwin", "arm64"),
        ("windows", "amd64"),
        ("windows", "arm64"),
    ];
    if KNOWN.contains(&(os, arch)) {
        Ok(())
    } else {
        Err(PullError::InvalidOptions(format!(
            "unsupported os/arch combination: {os}/{arch}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_url() {
        let opts = PullerOpts {
            url: "".into(),
            ..Default::default()
        };
        assert!(Puller::new(opts).is_err());
    }

    #[test]
    fn rejects_bad_scheme() {
        let opts = PullerOpts {
            url: "docker.io/library/alpine".into(),
            scheme: "ftp".into(),
            ..Default::default()
        };
        assert!(Puller::new(opts).is_err());
    }

    #[test]
    fn validates_known_platforms() {
        assert!(validate_platform("linux", "amd64").is_ok());
        assert!(validate_platform("plan9", "amd64").is_err());
    }

    #[test]
    fn builds_puller_for_valid_ref() {
        let opts = PullerOpts {
            url: "docker.io/library/alpine:latest".into(),
            ..Default::default()
        };
        let puller = Puller::new(opts).unwrap();
        assert_eq!(puller.image_ref().reference, "latest");
    }

    #[test]
    fn rejects_unsupported_platform_at_construction() {
        let opts = PullerOpts {
            url: "docker.io/library/alpine:latest".into(),
            os: "plan9".into(),
            arch: "amd64".into(),
            ..Default::default()
        };
        let err = Puller::new(opts).unwrap_err();
        assert!(matches!(err, PullError::InvalidOptions(_)));
    }
}
