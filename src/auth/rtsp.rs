//! RTSP challenge-response credential verification
//!
//! Validates the `Authorization` header of an RTSP request against a
//! stored credential pair, per RFC 7617 (Basic) and RFC 7616 (Digest with
//! MD5 or SHA-256). The challenge is always issued with `realm="IPCAM"`
//! and a caller-supplied nonce.

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use md5::Md5;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::credential::{Credential, CredentialError};
use crate::config::RtspAuthMethod;

/// Realm sent in every WWW-Authenticate challenge
pub const REALM: &str = "IPCAM";

/// The RTSP envelope carried by a request under authentication
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method, e.g. `ANNOUNCE`
    pub method: String,

    /// Absolute request URL
    pub url: String,

    /// Raw `Authorization` header value, when the client sent one
    pub authorization: Option<String>,
}

/// Build the WWW-Authenticate header values for a challenge
pub fn www_authenticate(methods: &[RtspAuthMethod], nonce: &str) -> Vec<String> {
    methods
        .iter()
        .map(|m| match m {
            RtspAuthMethod::Basic => format!("Basic realm=\"{REALM}\""),
            RtspAuthMethod::DigestMd5 => {
                format!("Digest realm=\"{REALM}\", nonce=\"{nonce}\", algorithm=\"MD5\"")
            }
            RtspAuthMethod::DigestSha256 => {
                format!("Digest realm=\"{REALM}\", nonce=\"{nonce}\", algorithm=\"SHA-256\"")
            }
        })
        .collect()
}

/// Verify the Authorization header of an RTSP request
///
/// Returns Ok(true) when the header matches the stored credentials under
/// one of the enabled methods. Digest verification requires the stored
/// password in plaintext; hashed storage never matches a digest response.
pub fn validate(
    req: &RtspRequest,
    user: &Credential,
    pass: &Credential,
    nonce: &str,
    methods: &[RtspAuthMethod],
) -> Result<bool, CredentialError> {
    let header = match &req.authorization {
        Some(h) => h.as_str(),
        None => return Ok(false),
    };

    if let Some(encoded) = header.strip_prefix("Basic ") {
        if !methods.contains(&RtspAuthMethod::Basic) {
            return Ok(false);
        }
        let decoded = match BASE64_STD.decode(encoded.trim()) {
            Ok(d) => d,
            Err(_) => return Ok(false),
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let (req_user, req_pass) = match decoded.split_once(':') {
            Some(p) => p,
            None => return Ok(false),
        };
        return Ok(user.check(req_user)? && pass.check(req_pass)?);
    }

    if let Some(fields) = header.strip_prefix("Digest ") {
        let fields = parse_auth_fields(fields);

        let algorithm = fields
            .get("algorithm")
            .map(String::as_str)
            .unwrap_or("MD5");
        let method_enabled = match algorithm {
            "MD5" => methods.contains(&RtspAuthMethod::DigestMd5),
            "SHA-256" => methods.contains(&RtspAuthMethod::DigestSha256),
            _ => false,
        };
        if !method_enabled {
            return Ok(false);
        }

        let (username, realm, hdr_nonce, uri, response) = match (
            fields.get("username"),
            fields.get("realm"),
            fields.get("nonce"),
            fields.get("uri"),
            fields.get("response"),
        ) {
            (Some(u), Some(r), Some(n), Some(uri), Some(resp)) => (u, r, n, uri, resp),
            _ => return Ok(false),
        };

        if realm != REALM || hdr_nonce != nonce || uri != &req.url {
            return Ok(false);
        }
        if !user.check(username)? {
            return Ok(false);
        }

        // the digest is computed over the original secret
        let plain_pass = match pass.as_plain() {
            Some(p) => p,
            None => return Ok(false),
        };

        let expected = digest_response(
            algorithm,
            username,
            plain_pass,
            nonce,
            &req.method,
            &req.url,
        );
        return Ok(bool::from(
            expected.as_bytes().ct_eq(response.as_bytes()),
        ));
    }

    Ok(false)
}

/// Compute the RFC 7616 response value (no qop, as used by RTSP cameras)
fn digest_response(
    algorithm: &str,
    username: &str,
    password: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let h = |input: String| -> String {
        match algorithm {
            "SHA-256" => hex::encode(Sha256::digest(input.as_bytes())),
            _ => hex::encode(Md5::digest(input.as_bytes())),
        }
    };
    let ha1 = h(format!("{username}:{REALM}:{password}"));
    let ha2 = h(format!("{method}:{uri}"));
    h(format!("{ha1}:{nonce}:{ha2}"))
}

/// Build a client Authorization header; counterpart of [`validate`]
#[cfg(test)]
pub(crate) fn digest_authorization(
    algorithm: &str,
    username: &str,
    password: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let response = digest_response(algorithm, username, password, nonce, method, uri);
    format!(
        "Digest username=\"{username}\", realm=\"{REALM}\", nonce=\"{nonce}\", \
         uri=\"{uri}\", response=\"{response}\", algorithm=\"{algorithm}\""
    )
}

/// Parse the comma-separated key=value fields of a Digest header
fn parse_auth_fields(raw: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    let mut rest = raw.trim();

    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(i) => i,
            None => break,
        };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = match stripped.find('"') {
                Some(i) => i,
                None => break,
            };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        fields.insert(key, value);
    }

    fields
}
