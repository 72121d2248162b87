//! Manifest variant model
//!
//! Represents the four OCI/Docker manifest media types as a tagged union,
//! with classification, parsing, layer projection, and platform selection.

use crate::media_types;
use crate::{PullError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which of the four manifest media types a response carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    DockerManifestList,
    DockerManifest,
    OciImageIndex,
    OciImageManifest,
}

pub fn classify(content_type: &str) -> Result<MediaKind> {
    // Registries sometimes append a charset; only match the type token.
    let ct = content_type.split(';').next().unwrap_or("").trim();
    match ct {
        media_types::DOCKER_MANIFEST_LIST => Ok(MediaKind::DockerManifestList),
        media_types::DOCKER_MANIFEST => Ok(MediaKind::DockerManifest),
        media_types::OCI_IMAGE_INDEX => Ok(MediaKind::OciImageIndex),
        media_types::OCI_IMAGE_MANIFEST => Ok(MediaKind::OciImageManifest),
        other => Err(PullError::UnknownManifestType(other.to_string())),
    }
}

/// A content descriptor shared by config and layer blobs, and by
/// per-platform manifest entries in an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A layer or config blob reference, as consumed by the fetch/store layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl From<&Descriptor> for Layer {
    fn from(d: &Descriptor) -> Self {
        Layer {
            media_type: d.media_type.clone(),
            digest: d.digest.clone(),
            size: d.size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// The decoded manifest, tagged by which of the four variants it is.
#[derive(Debug, Clone)]
pub enum Variant {
    DockerManifestList(ImageIndex),
    DockerManifest(ImageManifest),
    OciImageIndex(ImageIndex),
    OciImageManifest(ImageManifest),
}

impl Variant {
    pub fn kind(&self) -> MediaKind {
        match self {
            Variant::DockerManifestList(_) => MediaKind::DockerManifestList,
            Variant::DockerManifest(_) => MediaKind::DockerManifest,
            Variant::OciImageIndex(_) => MediaKind::OciImageIndex,
            Variant::OciImageManifest(_) => MediaKind::OciImageManifest,
        }
    }

    pub fn is_manifest_list(&self) -> bool {
        matches!(
            self,
            Variant::DockerManifestList(_) | Variant::OciImageIndex(_)
        )
    }

    fn as_index(&self) -> Result<&ImageIndex> {
        match self {
            Variant::DockerManifestList(i) | Variant::OciImageIndex(i) => Ok(i),
            _ => Err(PullError::UnsupportedManifestType(
                "not an index/list".into(),
            )),
        }
    }

    fn as_image(&self) -> Result<&ImageManifest> {
        match self {
            Variant::DockerManifest(m) | Variant::OciImageManifest(m) => Ok(m),
            _ => Err(PullError::UnsupportedManifestType(
                "not an image manifest".into(),
            )),
        }
    }

    /// All layers plus the config descriptor appended, since config is
    /// fetched through the same blob endpoint.
    pub fn layers(&self) -> Result<Vec<Layer>> {
        let image = self.as_image()?;
        let mut out: Vec<Layer> = image.layers.iter().map(Layer::from).collect();
        out.push(Layer::from(&image.config));
        Ok(out)
    }

    pub fn config(&self) -> Result<Layer> {
        Ok(Layer::from(&self.as_image()?.config))
    }

    /// Scan an index's entries for the first platform match.
    pub fn image_digest_for(&self, os: &str, arch: &str) -> Result<String> {
        let index = self.as_index()?;
        index
            .manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .map(|p| p.os == os && p.architecture == arch)
                    .unwrap_or(false)
            })
            .map(|m| m.digest.clone())
            .ok_or_else(|| {
                let available = index
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect::<Vec<_>>()
                    .join(", ");
                PullError::NoMatchingPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    available,
                }
            })
    }

    pub fn to_json_string(&self) -> Result<String> {
        let value = match self {
            Variant::DockerManifestList(i) | Variant::OciImageIndex(i) => {
                serde_json::to_string_pretty(i)?
            }
            Variant::DockerManifest(m) | Variant::OciImageManifest(m) => {
                serde_json::to_string_pretty(m)?
            }
        };
        Ok(value)
    }
}

/// Parse manifest bytes per the declared `MediaKind`.
pub fn parse(kind: MediaKind, bytes: &[u8]) -> Result<Variant> {
    match kind {
        MediaKind::DockerManifestList => {
            Ok(Variant::DockerManifestList(serde_json::from_slice(bytes)?))
        }
        MediaKind::OciImageIndex => Ok(Variant::OciImageIndex(serde_json::from_slice(bytes)?)),
        MediaKind::DockerManifest => Ok(Variant::DockerManifest(serde_json::from_slice(bytes)?)),
        MediaKind::OciImageManifest => {
            Ok(Variant::OciImageManifest(serde_json::from_slice(bytes)?))
        }
    }
}

/// Wraps a decoded manifest with the raw bytes it was parsed from (the
/// authoritative source for digest computation) and the digest/URL it was
/// fetched with.
#[derive(Debug, Clone)]
pub struct ManifestHolder {
    pub variant: Variant,
    pub raw: Vec<u8>,
    pub digest: String,
    pub image_url: String,
}

impl ManifestHolder {
    pub fn is_manifest_list(&self) -> bool {
        self.variant.is_manifest_list()
    }

    pub fn layers(&self) -> Result<Vec<Layer>> {
        self.variant.layers()
    }

    pub fn config(&self) -> Result<Layer> {
        self.variant.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Vec<u8> {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_IMAGE_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "size": 10
            },
            "layers": [
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                    "size": 100
                }
            ]
        })
        .to_string()
        .into_bytes()
    }

    fn sample_index() -> Vec<u8> {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_IMAGE_INDEX,
            "manifests": [
                {
                    "mediaType": media_types::OCI_IMAGE_MANIFEST,
                    "digest": "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc",
                    "size": 500,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": media_types::OCI_IMAGE_MANIFEST,
                    "digest": "sha256:dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd",
                    "size": 500,
                    "platform": {"architecture": "arm64", "os": "linux"}
                }
            ]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn classifies_known_types() {
        assert_eq!(
            classify(media_types::OCI_IMAGE_MANIFEST).unwrap(),
            MediaKind::OciImageManifest
        );
        assert!(classify("text/plain").is_err());
    }

    #[test]
    fn layers_appends_config() {
        let v = parse(MediaKind::OciImageManifest, &sample_manifest()).unwrap();
        let layers = v.layers().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].digest, v.config().unwrap().digest);
    }

    #[test]
    fn image_digest_for_selects_platform() {
        let v = parse(MediaKind::OciImageIndex, &sample_index()).unwrap();
        let digest = v.image_digest_for("linux", "arm64").unwrap();
        assert!(digest.ends_with("dddd"));
    }

    #[test]
    fn image_digest_for_missing_platform_errors() {
        let v = parse(MediaKind::OciImageIndex, &sample_index()).unwrap();
        let err = v.image_digest_for("windows", "amd64").unwrap_err();
        match err {
            PullError::NoMatchingPlatform { os, arch, .. } => {
                assert_eq!(os, "windows");
                assert_eq!(arch, "amd64");
            }
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn layers_on_index_is_unsupported() {
        let v = parse(MediaKind::OciImageIndex, &sample_index()).unwrap();
        assert!(v.layers().is_err());
    }
}
