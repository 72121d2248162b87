//! Auth state machine
//!
//! Anonymous -> Probed -> Authenticated | Denied, driven by parsing
//! `WWW-Authenticate` challenges returned from `HEAD /v2/`.

use crate::{PullError, Result};
use base64::Engine;
use reqwest::header::HeaderValue;

/// The auth header value to attach to subsequent requests, once acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    None,
    Bearer(String),
    Basic(String),
}

impl AuthState {
    pub fn header_value(&self) -> Option<String> {
        match self {
            AuthState::None => None,
            AuthState::Bearer(token) => Some(format!("Bearer {token}")),
            AuthState::Basic(encoded) => Some(format!("Basic {encoded}")),
        }
    }
}

/// A single parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer { realm: String, service: String },
    Basic,
    Other(String),
}

/// Parse a `WWW-Authenticate` header value into its scheme and, for
/// `Bearer`, the quoted `realm`/`service` parameters.
///
/// Uses a permissive quoted-string scan rather than a character-class-
/// restricted regex, since real registries emit `?` and `=` inside
/// realm/service values (pre-signed URLs and the like).
pub fn parse_challenge(header: &str) -> Challenge {
    let trimmed = header.trim();
    let scheme_end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let scheme = &trimmed[..scheme_end];

    if scheme.eq_ignore_ascii_case("basic") {
        return Challenge::Basic;
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Challenge::Other(scheme.to_string());
    }

    let params = parse_quoted_params(&trimmed[scheme_end..]);
    match (params.get("realm"), params.get("service")) {
        (Some(realm), Some(service)) => Challenge::Bearer {
            realm: realm.clone(),
            service: service.clone(),
        },
        _ => Challenge::Other("bearer (missing realm/service)".to_string()),
    }
}

/// Scan `key="value"` pairs out of a header parameter list, tolerating any
/// character inside the quotes.
fn parse_quoted_params(s: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b',' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            // No `=` before the next comma/end: not a key=value pair.
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            continue;
        }
        let key = s[key_start..i].trim().to_string();
        i += 1; // skip '='
        if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let value_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let value = s[value_start..i].to_string();
            out.insert(key, value);
            i += 1; // skip closing quote
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            out.insert(key, s[value_start..i].trim().to_string());
        }
    }
    out
}

pub fn basic_credentials(username: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}

pub fn authorization_header(state: &AuthState) -> Option<HeaderValue> {
    state
        .header_value()
        .and_then(|v| HeaderValue::from_str(&v).ok())
}

/// Bearer token response body from the auth realm.
#[derive(Debug, serde::Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "access_token")]
    pub token: String,
}

pub fn auth_failed_if_not_ok(status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(PullError::AuthFailed(status))
    }
}
