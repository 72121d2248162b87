//! End-to-end pulls against an in-process mock registry, covering the two
//! auth flows a `Puller` has to drive itself through: anonymous-bearer and
//! basic.

use imgpull::puller::{Puller, PullerOpts};
use serde_json::json;
use sha2::{Digest, Sha256};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG_BYTES: &[u8] = b"{\"config\":true}";
const LAYER_BYTES: &[u8] = b"layer-bytes-not-really-a-tarball";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn sample_manifest_bytes() -> (Vec<u8>, String, String) {
    let config_digest = sha256_hex(CONFIG_BYTES);
    let layer_digest = sha256_hex(LAYER_BYTES);
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{config_digest}"),
            "size": CONFIG_BYTES.len(),
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": format!("sha256:{layer_digest}"),
                "size": LAYER_BYTES.len(),
            }
        ],
    });
    let bytes = serde_json::to_vec(&manifest).unwrap();
    (bytes, config_digest, layer_digest)
}

#[tokio::test]
async fn pulls_to_dir_through_bearer_challenge() {
    let server = MockServer::start().await;
    let (manifest_bytes, config_digest, layer_digest) = sample_manifest_bytes();
    let manifest_digest = sha256_hex(&manifest_bytes);

    let token_path = "/token";
    Mock::given(method("HEAD"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            format!(
                r#"Bearer realm="{}{token_path}",service="test-registry""#,
                server.uri()
            ),
        ))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(token_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/library/demo/manifests/latest"))
        .and(header("Authorization", "Bearer tok-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
                .insert_header("Docker-Content-Digest", format!("sha256:{manifest_digest}"))
                .set_body_bytes(manifest_bytes),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/library/demo/blobs/sha256:{layer_digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(LAYER_BYTES))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/library/demo/blobs/sha256:{config_digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONFIG_BYTES))
        .mount(&server)
        .await;

    let host = server.address().to_string();
    let opts = PullerOpts {
        url: format!("{host}/library/demo:latest"),
        scheme: "http".to_string(),
        ..PullerOpts::default()
    };
    let puller = Puller::new(opts).unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let holder = puller.pull_to_dir(out_dir.path()).await.unwrap();

    assert_eq!(holder.digest, format!("sha256:{manifest_digest}"));
    assert!(out_dir.path().join(&config_digest).exists());
    assert!(out_dir.path().join(&layer_digest).exists());
    assert_eq!(
        std::fs::read(out_dir.path().join(&layer_digest)).unwrap(),
        LAYER_BYTES
    );
}

#[tokio::test]
async fn pulls_to_dir_through_basic_auth() {
    let server = MockServer::start().await;
    let (manifest_bytes, config_digest, layer_digest) = sample_manifest_bytes();
    let manifest_digest = sha256_hex(&manifest_bytes);
    let expected_auth = format!(
        "Basic {}",
        imgpull::auth::basic_credentials("alice", "hunter2")
    );

    Mock::given(method("HEAD"))
        .and(path("/v2/"))
        .and(header("Authorization", expected_auth.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/v2/"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("WWW-Authenticate", r#"Basic realm="test-registry""#),
        )
        .with_priority(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/library/demo/manifests/latest"))
        .and(header("Authorization", expected_auth.as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
                .insert_header("Docker-Content-Digest", format!("sha256:{manifest_digest}"))
                .set_body_bytes(manifest_bytes),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/library/demo/blobs/sha256:{layer_digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(LAYER_BYTES))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/library/demo/blobs/sha256:{config_digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONFIG_BYTES))
        .mount(&server)
        .await;

    let host = server.address().to_string();
    let opts = PullerOpts {
        url: format!("{host}/library/demo:latest"),
        scheme: "http".to_string(),
        username: Some("alice".to_string()),
        password: Some("hunter2".to_string()),
        ..PullerOpts::default()
    };
    let puller = Puller::new(opts).unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let holder = puller.pull_to_dir(out_dir.path()).await.unwrap();
    assert_eq!(holder.digest, format!("sha256:{manifest_digest}"));
}
