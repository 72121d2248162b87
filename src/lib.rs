//! imgpull - a read-only OCI Distribution v2 client
//!
//! Pulls container images from any registry implementing the OCI
//! Distribution v2 HTTP protocol and materializes the result either as a
//! Docker-compatible image tarball or as loose manifests and blobs on the
//! local filesystem. Never pushes.

pub mod auth;
pub mod cli;
pub mod coordinator;
pub mod digest;
pub mod manifest;
pub mod puller;
pub mod reference;
pub mod registry;
pub mod tarball;

use thiserror::Error;

/// Main error type for imgpull operations
#[derive(Error, Debug)]
pub enum PullError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("authentication failed with status {0}")]
    AuthFailed(reqwest::StatusCode),

    #[error("malformed WWW-Authenticate header: {0}")]
    MalformedAuthHeader(String),

    #[error("manifest fetch failed with status {0}")]
    ManifestFetchFailed(reqwest::StatusCode),

    #[error("malformed HEAD manifest response: {0}")]
    MalformedHeadResponse(String),

    #[error("unknown manifest media type: {0}")]
    UnknownManifestType(String),

    #[error("unsupported operation for this manifest variant: {0}")]
    UnsupportedManifestType(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("no manifest found for platform {os}/{arch} (available: {available})")]
    NoMatchingPlatform {
        os: String,
        arch: String,
        available: String,
    },

    #[error("server did not provide an image list/index")]
    NoImageList,

    #[error("unsupported layer media type: {0}")]
    UnsupportedLayerMediaType(String),

    #[error("timed out waiting for in-flight fetch")]
    Timeout,

    #[error("leader fetch failed: {0}")]
    LeaderFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PullError>;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "imgpull";

/// Manifest media types understood by this client.
pub mod media_types {
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    /// All four, comma-separated, for the `Accept` header on manifest requests.
    pub fn accept_header() -> String {
        [
            DOCKER_MANIFEST,
            OCI_IMAGE_MANIFEST,
            DOCKER_MANIFEST_LIST,
            OCI_IMAGE_INDEX,
        ]
        .join(", ")
    }
}
