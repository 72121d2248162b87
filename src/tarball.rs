//! Tar assembler
//!
//! Emits a `docker save`-compatible tarball: layer blobs, a single-element
//! `manifest.json` array, and the config blob, in that order.

use crate::manifest::Layer;
use crate::{PullError, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Everything the assembler needs: where the fetched blobs live, what the
/// tarball's embedded `RepoTags` entry should say, and the ordered layers.
#[derive(Debug, Clone)]
pub struct ImageTarball {
    pub source_dir: PathBuf,
    pub image_url: String,
    /// Bare hex digest of the config blob.
    pub config_digest: String,
    pub layers: Vec<Layer>,
}

#[derive(Debug, Serialize)]
struct DockerManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Map a layer's media type to the in-tar file extension `docker load`
/// expects.
fn extension_for(media_type: &str) -> Result<&'static str> {
    if media_type.ends_with("tar") {
        Ok(".tar")
    } else if media_type.ends_with("tar.gzip") || media_type.ends_with("tar+gzip") {
        Ok(".tar.gz")
    } else if media_type.ends_with("tar.zstd") || media_type.ends_with("tar+zstd") {
        Ok(".tar.zstd")
    } else {
        Err(PullError::UnsupportedLayerMediaType(media_type.to_string()))
    }
}

/// True if `path` starts with a valid gzip stream. Used to recover the right
/// extension when a registry omits the layer media type entirely, since
/// `docker load` picks its decompressor from the file extension.
fn sniffs_as_gzip(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut decoder = GzDecoder::new(file);
    let mut probe = [0u8; 1];
    // A malformed stream errors on the first read; an empty-but-valid gzip
    // member returns Ok(0), which still counts as gzip.
    decoder.read(&mut probe).is_ok()
}

/// Resolve the in-tar extension for a layer already fetched to `blob_path`,
/// falling back to gzip-magic sniffing when the registry sent no media type.
fn extension_for_blob(media_type: &str, blob_path: &Path) -> Result<&'static str> {
    if media_type.is_empty() {
        return Ok(if sniffs_as_gzip(blob_path) {
            ".tar.gz"
        } else {
            ".tar"
        });
    }
    extension_for(media_type)
}

fn bare(digest: &str) -> String {
    crate::digest::digest_from(digest).unwrap_or_else(|| digest.to_string())
}

/// Build the tarball at `dest_path` from the already-fetched blobs in
/// `tarball.source_dir`.
pub fn assemble(tarball: &ImageTarball, dest_path: &Path) -> Result<()> {
    let file = File::create(dest_path)?;
    write_to(tarball, file)
}

fn write_to<W: Write>(tarball: &ImageTarball, writer: W) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let mut layer_names = Vec::with_capacity(tarball.layers.len());
    for layer in &tarball.layers {
        let digest = bare(&layer.digest);
        let src = tarball.source_dir.join(&digest);
        let ext = extension_for_blob(&layer.media_type, &src)?;
        let name = format!("{digest}{ext}");
        let mut f = File::open(&src)?;
        builder.append_file(&name, &mut f)?;
        layer_names.push(name);
    }

    let entry = DockerManifestEntry {
        config: format!("sha256:{}", tarball.config_digest),
        repo_tags: vec![tarball.image_url.clone()],
        layers: layer_names,
    };
    // The JSON array wrapper is bit-significant: `docker load` rejects a
    // bare object.
    let manifest_json = serde_json::to_vec(&vec![entry])?;
    append_bytes(&mut builder, "manifest.json", &manifest_json)?;

    let config_src = tarball.source_dir.join(&tarball.config_digest);
    let config_name = format!("sha256:{}", tarball.config_digest);
    let mut config_file = File::open(&config_src)?;
    builder.append_file(&config_name, &mut config_file)?;

    builder.finish()?;
    Ok(())
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    // SAFETY: getuid/getgid take no arguments and never fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    header.set_uid(uid as u64);
    header.set_gid(gid as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Layer;

    fn write_blob(dir: &Path, digest: &str, bytes: &[u8]) {
        std::fs::write(dir.join(digest), bytes).unwrap();
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(
            extension_for("application/vnd.oci.image.layer.v1.tar+gzip").unwrap(),
            ".tar.gz"
        );
        assert_eq!(
            extension_for("application/vnd.docker.image.rootfs.diff.tar.gzip").unwrap(),
            ".tar.gz"
        );
        assert_eq!(
            extension_for("application/vnd.oci.image.layer.v1.tar").unwrap(),
            ".tar"
        );
        assert_eq!(
            extension_for("application/vnd.oci.image.layer.v1.tar+zstd").unwrap(),
            ".tar.zstd"
        );
        assert!(extension_for("application/unknown").is_err());
    }

    #[test]
    fn sniffs_gzip_when_media_type_missing() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let tmp = tempfile::TempDir::new().unwrap();
        let gz_path = tmp.path().join("gz-blob");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::fast());
        encoder.write_all(b"some tar bytes").unwrap();
        encoder.finish().unwrap();
        assert_eq!(extension_for_blob("", &gz_path).unwrap(), ".tar.gz");

        let plain_path = tmp.path().join("plain-blob");
        std::fs::write(&plain_path, b"not gzip").unwrap();
        assert_eq!(extension_for_blob("", &plain_path).unwrap(), ".tar");
    }

    #[test]
    fn assembles_single_element_manifest_array() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layer_digest = "b".repeat(64);
        let config_digest = "a".repeat(64);
        write_blob(tmp.path(), &layer_digest, b"layer-bytes");
        write_blob(tmp.path(), &config_digest, b"config-bytes");

        let tarball = ImageTarball {
            source_dir: tmp.path().to_path_buf(),
            image_url: "docker.io/library/hello-world:latest".to_string(),
            config_digest: config_digest.clone(),
            layers: vec![Layer {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                digest: format!("sha256:{layer_digest}"),
                size: 11,
            }],
        };

        let mut bytes = Vec::new();
        write_to(&tarball, &mut bytes).unwrap();

        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
        let mut names = Vec::new();
        let mut manifest_contents = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            if path == "manifest.json" {
                let mut s = String::new();
                entry.read_to_string(&mut s).unwrap();
                manifest_contents = Some(s);
            }
            names.push(path);
        }

        assert_eq!(
            names,
            vec![
                format!("{layer_digest}.tar.gz"),
                "manifest.json".to_string(),
                format!("sha256:{config_digest}"),
            ]
        );

        let parsed: serde_json::Value =
            serde_json::from_str(&manifest_contents.unwrap()).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed.as_array().unwrap().len(), 1);
        assert_eq!(
            parsed[0]["RepoTags"][0],
            "docker.io/library/hello-world:latest"
        );
        assert_eq!(parsed[0]["Config"], format!("sha256:{config_digest}"));
        assert_eq!(parsed[0]["Layers"][0], format!("{layer_digest}.tar.gz"));
    }
}
