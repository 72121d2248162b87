//! Digest extraction/verification and the content-addressed blob store.

use crate::{PullError, Result};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use std::io::Write;

/// Extract the bare 64-hex digest from a string such as `sha256:<hex>`,
/// bounded by word characters on either side (so a trailing/leading quote
/// or whitespace is tolerated).
pub fn digest_from(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_hexdigit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                i += 1;
            }
            let run = &s[start..i];
            let bounded_left = start == 0 || !is_word_byte(bytes[start - 1]);
            let bounded_right = i == bytes.len() || !is_word_byte(bytes[i]);
            if run.len() == 64 && bounded_left && bounded_right {
                return Some(run.to_string());
            }
        } else {
            i += 1;
        }
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Compute SHA-256 over `bytes` and compare to the bare hex extracted from
/// `expected` (which may carry a `sha256:` prefix or not).
pub fn verify(bytes: &[u8], expected: &str) -> Result<String> {
    let actual = sha256_hex(bytes);
    let expected_bare = digest_from(expected).ok_or_else(|| PullError::DigestMismatch {
        expected: expected.to_string(),
        actual: actual.clone(),
    })?;
    if actual != expected_bare {
        return Err(PullError::DigestMismatch {
            expected: expected_bare,
            actual,
        });
    }
    Ok(actual)
}

/// A content-addressed directory of blob files, named by bare 64-hex
/// digest.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BlobStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, bare_digest: &str) -> PathBuf {
        self.dir.join(bare_digest)
    }

    /// True when a file for this digest exists and has exactly the
    /// expected size. Partial writes must never satisfy this check.
    pub fn has(&self, bare_digest: &str, expected_size: u64) -> bool {
        match std::fs::metadata(self.path_for(bare_digest)) {
            Ok(meta) => meta.len() == expected_size,
            Err(_) => false,
        }
    }

    /// Write `bytes` to the blob file for `bare_digest`, atomically from the
    /// caller's point of view: writes go to a sibling temp file first, and
    /// only a clean write is renamed into place. Any failure removes the
    /// partial file.
    pub fn write(&self, bare_digest: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let tmp_path = self.dir.join(format!("{bare_digest}.tmp"));
        let result = (|| -> Result<()> {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                std::fs::rename(&tmp_path, self.path_for(bare_digest))?;
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}
