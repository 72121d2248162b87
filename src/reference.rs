//! Image reference parsing
//!
//! Parses `host[:port][/ns]/repo[/...]/name:tag|@digest` into a canonical,
//! immutable `ImageRef`.

use crate::{PullError, Result};

const DOCKER_IO: &str = "docker.io";
const DOCKER_IO_SERVER: &str = "index.docker.io";

/// How the reference portion of the image URL was expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    ByTag,
    ByDigest,
}

/// A parsed, canonical image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// The exact string the caller passed in.
    pub raw: String,
    pub scheme: String,
    /// Registry host as written in the URL (e.g. "docker.io", "localhost:8080").
    pub registry: String,
    /// The host actually contacted over the wire.
    pub server: String,
    /// Pull-through namespace, if any.
    pub namespace: Option<String>,
    /// True when the namespace was embedded in the URL path rather than
    /// supplied separately by the caller.
    pub ns_in_path: bool,
    /// One or more `/`-separated repository segments (e.g. `["library", "alpine"]`).
    pub repository: Vec<String>,
    /// Tag or digest.
    pub reference: String,
    pub pull_mode: PullMode,
    /// True when the registry is docker.io and the repository had a single
    /// segment, so `library/` was inserted.
    pub library: bool,
}

fn looks_like_hostname(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':')
}

fn is_64_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl ImageRef {
    /// Parse an image URL. `scheme` is `http` or `https`. `default_namespace`
    /// is attached (as a query-form pull-through namespace) when the URL
    /// itself carries no in-path namespace.
    pub fn parse(url: &str, scheme: &str, default_namespace: Option<&str>) -> Result<Self> {
        let raw = url.to_string();
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(PullError::InvalidReference("empty image reference".into()));
        }

        let mut segments: Vec<&str> = trimmed.split('/').collect();
        if segments.is_empty() || segments[0].is_empty() {
            return Err(PullError::InvalidReference(
                "missing registry host".into(),
            ));
        }

        let registry = segments.remove(0).to_string();
        let server = if registry == DOCKER_IO {
            DOCKER_IO_SERVER.to_string()
        } else {
            registry.clone()
        };

        if segments.is_empty() {
            return Err(PullError::InvalidReference(
                "missing repository path".into(),
            ));
        }

        // Namespace embedding: a second path segment that looks like a
        // hostname is an in-path pull-through namespace.
        let (namespace, ns_in_path) = if segments.len() > 1 && looks_like_hostname(segments[0]) {
            let ns = segments.remove(0).to_string();
            (Some(ns), true)
        } else if let Some(ns) = default_namespace {
            (Some(ns.to_string()), false)
        } else {
            (None, false)
        };

        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(PullError::InvalidReference(
                "repository has an empty segment".into(),
            ));
        }

        // The last segment carries the optional tag/digest suffix.
        let last = segments.pop().unwrap();
        let (name, reference, pull_mode) = split_reference(last)?;
        if name.is_empty() {
            return Err(PullError::InvalidReference("empty name segment".into()));
        }
        segments.push(name);

        let mut repository: Vec<String> = segments.into_iter().map(String::from).collect();

        let library = registry == DOCKER_IO && repository.len() == 1;
        if library {
            repository.insert(0, "library".to_string());
        }

        Ok(ImageRef {
            raw,
            scheme: scheme.to_string(),
            registry,
            server,
            namespace,
            ns_in_path,
            repository,
            reference,
            pull_mode,
            library,
        })
    }

    /// `<scheme>://<server>`
    pub fn server_url(&self) -> String {
        format!("{}://{}", self.scheme, self.server)
    }

    fn separator(&self) -> char {
        if self.reference.starts_with("sha256:") {
            '@'
        } else {
            ':'
        }
    }

    fn repo_path(&self) -> String {
        self.repository.join("/")
    }

    /// Canonical image URL using the registry host.
    pub fn url(&self) -> String {
        format!(
            "{}/{}{}{}",
            self.registry,
            self.repo_path(),
            self.separator(),
            self.reference
        )
    }

    /// Canonical image URL with the pull-through namespace (if any)
    /// substituted in place of the registry host. This is the value used
    /// for the tarball's `RepoTags`.
    pub fn url_with_ns(&self) -> String {
        let host = self.namespace.as_deref().unwrap_or(&self.registry);
        format!(
            "{}/{}{}{}",
            host,
            self.repo_path(),
            self.separator(),
            self.reference
        )
    }

    pub fn repository(&self) -> String {
        self.repo_path()
    }
}

/// Split a trailing repository segment into (name, reference, mode).
fn split_reference(segment: &str) -> Result<(&str, String, PullMode)> {
    let has_at = segment.contains('@');
    if has_at {
        let (name, rest) = segment.split_once('@').unwrap();
        // A `:tag` appearing after the `@sha256:...` digest would be
        // ambiguous (e.g. "name@sha256:abc:tag").
        let digest = rest;
        if !digest.starts_with("sha256:") || !is_64_hex(&digest["sha256:".len()..]) {
            return Err(PullError::InvalidReference(format!(
                "malformed digest reference: {digest}"
            )));
        }
        if digest["sha256:".len()..]
            .find(':')
            .is_some()
        {
            return Err(PullError::InvalidReference(format!(
                "ambiguous reference: {segment}"
            )));
        }
        return Ok((name, digest.to_string(), PullMode::ByDigest));
    }

    if let Some((name, tag)) = segment.rsplit_once(':') {
        if tag.is_empty() {
            return Err(PullError::InvalidReference(format!(
                "empty tag in: {segment}"
            )));
        }
        return Ok((name, tag.to_string(), PullMode::ByTag));
    }

    Ok((segment, "latest".to_string(), PullMode::ByTag))
}
