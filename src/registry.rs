//! Registry client protocol
//!
//! A transient view over a `reqwest::Client`, an `ImageRef`, and the
//! puller's current `AuthState` — constructed per operation, never
//! outliving the `Puller` that owns those pieces.

use crate::auth::{self, AuthState, TokenResponse};
use crate::digest;
use crate::manifest::{self, Layer, ManifestHolder, MediaKind, Variant};
use crate::reference::ImageRef;
use crate::{media_types, PullError, Result};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use sha2::Digest as _;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

/// Cap on how much of a manifest body we'll buffer in memory.
const MAX_MANIFEST_BYTES: usize = 100 * 1024 * 1024;
/// Size of each read from the blob stream, bounding peak memory to
/// O(chunk) rather than O(blob size) no matter how the server chunks its
/// response.
const BLOB_CHUNK_CAP: usize = 64 * 1024;

pub struct RegistryClient<'a> {
    client: &'a reqwest::Client,
    image_ref: &'a ImageRef,
    auth: Option<&'a AuthState>,
}

impl<'a> RegistryClient<'a> {
    pub fn new(
        client: &'a reqwest::Client,
        image_ref: &'a ImageRef,
        auth: Option<&'a AuthState>,
    ) -> Self {
        RegistryClient {
            client,
            image_ref,
            auth,
        }
    }

    fn base_repo_path(&self) -> String {
        if self.image_ref.ns_in_path {
            let ns = self.image_ref.namespace.as_deref().unwrap_or_default();
            format!("/v2/{}/{}", ns, self.image_ref.repository())
        } else {
            format!("/v2/{}", self.image_ref.repository())
        }
    }

    fn ns_query(&self) -> Option<(&'static str, String)> {
        if !self.image_ref.ns_in_path {
            if let Some(ns) = &self.image_ref.namespace {
                return Some(("ns", ns.clone()));
            }
        }
        None
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "{}{}/manifests/{}",
            self.image_ref.server_url(),
            self.base_repo_path(),
            reference
        )
    }

    fn blob_url(&self, digest: &str) -> String {
        format!(
            "{}{}/blobs/{}",
            self.image_ref.server_url(),
            self.base_repo_path(),
            digest
        )
    }

    fn accept_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&media_types::accept_header()).unwrap(),
        );
        if let Some(auth) = self.auth {
            if let Some(v) = auth::authorization_header(auth) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        headers
    }

    /// `HEAD /v2/`. Returns (status, every `WWW-Authenticate` header value).
    pub async fn v2_ping(&self) -> Result<(StatusCode, Vec<String>)> {
        let url = format!("{}/v2/", self.image_ref.server_url());
        trace!(url, "v2 ping");
        let resp = self.client.head(&url).send().await?;
        let status = resp.status();
        let challenges = resp
            .headers()
            .get_all(reqwest::header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        Ok((status, challenges))
    }

    /// `GET <realm>?scope=repository:<repo>:pull&service=<service>`.
    pub async fn v2_bearer(&self, realm: &str, service: &str) -> Result<String> {
        let scope = format!("repository:{}:pull", self.image_ref.repository());
        debug!(realm, service, scope, "requesting bearer token");
        let resp = self
            .client
            .get(realm)
            .query(&[("scope", scope.as_str()), ("service", service)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PullError::AuthFailed(status));
        }
        let body: TokenResponse = resp.json().await?;
        Ok(body.token)
    }

    /// `HEAD /v2/` with `Authorization: Basic <encoded>`.
    pub async fn v2_basic(&self, encoded: &str) -> Result<()> {
        let url = format!("{}/v2/", self.image_ref.server_url());
        let resp = self
            .client
            .head(&url)
            .header(AUTHORIZATION, format!("Basic {encoded}"))
            .send()
            .await?;
        auth::auth_failed_if_not_ok(resp.status())
    }

    /// `GET /v2/<repo>/manifests/<ref>`, with digest verification against
    /// `Docker-Content-Digest` when present.
    pub async fn v2_get_manifest(&self, sha: Option<&str>) -> Result<ManifestHolder> {
        let reference = sha.unwrap_or(&self.image_ref.reference);
        let url = self.manifest_url(reference);
        let mut req = self.client.get(&url).headers(self.accept_headers());
        if let Some((k, v)) = self.ns_query() {
            req = req.query(&[(k, v)]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PullError::ManifestFetchFailed(status));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let server_digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = {
            let mut buf = Vec::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if buf.len() + chunk.len() > MAX_MANIFEST_BYTES {
                    return Err(PullError::ManifestFetchFailed(StatusCode::PAYLOAD_TOO_LARGE));
                }
                buf.extend_from_slice(&chunk);
            }
            buf
        };

        let computed = {
            let sha = sha2::Sha256::digest(&bytes);
            format!("sha256:{}", hex::encode(sha))
        };

        let digest = match &server_digest {
            Some(server_digest) => {
                let verified = digest::verify(&bytes, server_digest)?;
                format!("sha256:{verified}")
            }
            None => computed,
        };

        let kind = manifest::classify(&content_type)?;
        let variant = manifest::parse(kind, &bytes)?;

        Ok(ManifestHolder {
            variant,
            raw: bytes,
            digest,
            image_url: self.image_ref.url_with_ns(),
        })
    }

    /// `HEAD /v2/<repo>/manifests/<ref>`.
    pub async fn v2_head_manifest(&self) -> Result<(MediaKind, String, u64)> {
        let url = self.manifest_url(&self.image_ref.reference);
        let mut req = self.client.head(&url).headers(self.accept_headers());
        if let Some((k, v)) = self.ns_query() {
            req = req.query(&[(k, v)]);
        }
        let resp = req.send().await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        match (content_type, digest) {
            (Some(ct), Some(d)) if !ct.is_empty() && !d.is_empty() => {
                Ok((manifest::classify(&ct)?, d, size))
            }
            _ => Err(PullError::MalformedHeadResponse(
                "missing Content-Type or Docker-Content-Digest".into(),
            )),
        }
    }

    /// `GET /v2/<repo>/blobs/<digest>`, streaming to `to_file` in bounded
    /// chunks. Skips the network round trip entirely if the cache already
    /// has a file of the expected size.
    pub async fn v2_get_blob(&self, layer: &Layer, to_file: &Path) -> Result<()> {
        let bare = digest::digest_from(&layer.digest).ok_or_else(|| {
            PullError::InvalidOptions(format!("malformed layer digest: {}", layer.digest))
        })?;
        if let Some(parent) = to_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Ok(meta) = tokio::fs::metadata(to_file).await {
            if meta.len() == layer.size {
                trace!(digest = %bare, "blob cache hit, skipping fetch");
                return Ok(());
            }
        }

        let url = self.blob_url(&layer.digest);
        let mut headers = HeaderMap::new();
        if let Some(auth) = self.auth {
            if let Some(v) = auth::authorization_header(auth) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        let resp = self.client.get(&url).headers(headers).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PullError::ManifestFetchFailed(status));
        }

        let tmp_path = to_file.with_extension("tmp");
        let mut written: u64 = 0;
        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            // `StreamReader` adapts reqwest's byte-chunk stream into an
            // `AsyncRead`, so the read buffer below bounds peak memory to
            // its own fixed size regardless of how large a chunk the
            // server sends over the wire in one go.
            let byte_stream = resp
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
            let mut reader = StreamReader::new(byte_stream);
            let mut buf = vec![0u8; BLOB_CHUNK_CAP];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            file.flush().await?;
            Ok::<(), PullError>(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        if written != layer.size {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(PullError::ShortRead {
                expected: layer.size,
                actual: written,
            });
        }

        tokio::fs::rename(&tmp_path, to_file).await?;
        Ok(())
    }
}

pub fn variant_media_type(variant: &Variant) -> &'static str {
    match variant.kind() {
        MediaKind::DockerManifestList => media_types::DOCKER_MANIFEST_LIST,
        MediaKind::DockerManifest => media_types::DOCKER_MANIFEST,
        MediaKind::OciImageIndex => media_types::OCI_IMAGE_INDEX,
        MediaKind::OciImageManifest => media_types::OCI_IMAGE_MANIFEST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ImageRef;

    fn make_ref(url: &str, ns: Option<&str>) -> ImageRef {
        ImageRef::parse(url, "http", ns).unwrap()
    }

    #[test]
    fn manifest_url_uses_query_form_ns() {
        let image_ref = make_ref("localhost:8080/curl/curl:8.10.1", Some("quay.io"));
        let client = reqwest::Client::new();
        let rc = RegistryClient::new(&client, &image_ref, None);
        assert_eq!(
            rc.manifest_url(&image_ref.reference),
            "http://localhost:8080/v2/curl/curl/manifests/8.10.1"
        );
        assert_eq!(rc.ns_query(), Some(("ns", "quay.io".to_string())));
    }

    #[test]
    fn manifest_url_uses_path_form_ns() {
        let image_ref = make_ref("localhost:8080/quay.io/curl/curl:8.10.1", None);
        let client = reqwest::Client::new();
        let rc = RegistryClient::new(&client, &image_ref, None);
        assert_eq!(
            rc.manifest_url(&image_ref.reference),
            "http://localhost:8080/v2/quay.io/curl/curl/manifests/8.10.1"
        );
        assert_eq!(rc.ns_query(), None);
    }
}
