//! Credential storage and verification
//!
//! Credentials are configured either as plaintext or in a tagged hashed
//! form: `sha256:<base64>` (standard alphabet) or `argon2:<PHC string>`.
//! Verification is encoding-aware: plaintext and SHA-256 comparisons run in
//! constant time, Argon2 is verified with the parameters embedded in the
//! PHC string (all three variants are accepted).

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A stored secret in one of the supported encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Plaintext value
    Plain(String),

    /// Base64-encoded SHA-256 digest of the value
    Sha256(String),

    /// Argon2 hash in PHC string format
    Argon2(String),
}

impl Credential {
    /// Parse a credential from its configured string form
    pub fn parse(value: &str) -> Self {
        if let Some(rest) = value.strip_prefix("sha256:") {
            Credential::Sha256(rest.to_string())
        } else if let Some(rest) = value.strip_prefix("argon2:") {
            Credential::Argon2(rest.to_string())
        } else {
            Credential::Plain(value.to_string())
        }
    }

    /// Whether this is an empty plaintext credential
    ///
    /// A user whose user and pass are both empty plaintext accepts
    /// anonymous requests.
    pub fn is_empty_plain(&self) -> bool {
        matches!(self, Credential::Plain(v) if v.is_empty())
    }

    /// The plaintext value, when stored unhashed
    ///
    /// RTSP digest verification needs the original secret and therefore
    /// only works with plaintext storage.
    pub fn as_plain(&self) -> Option<&str> {
        match self {
            Credential::Plain(v) => Some(v),
            _ => None,
        }
    }

    /// Verify a candidate value against the stored credential
    ///
    /// # Errors
    ///
    /// [`CredentialError`] when the stored hash cannot be parsed; callers
    /// treat this as a configuration problem, not a mismatch.
    pub fn check(&self, candidate: &str) -> Result<bool, CredentialError> {
        match self {
            Credential::Plain(stored) => {
                Ok(bool::from(stored.as_bytes().ct_eq(candidate.as_bytes())))
            }
            Credential::Sha256(stored) => {
                let stored = BASE64_STD
                    .decode(stored)
                    .map_err(|e| CredentialError::MalformedSha256(e.to_string()))?;
                if stored.len() != Sha256::output_size() {
                    return Err(CredentialError::MalformedSha256(format!(
                        "expected {} digest bytes, got {}",
                        Sha256::output_size(),
                        stored.len()
                    )));
                }
                let digest = Sha256::digest(candidate.as_bytes());
                Ok(bool::from(stored.as_slice().ct_eq(digest.as_slice())))
            }
            Credential::Argon2(stored) => {
                let parsed = PasswordHash::new(stored)
                    .map_err(|e| CredentialError::MalformedArgon2(e.to_string()))?;
                Ok(Argon2::default()
                    .verify_password(candidate.as_bytes(), &parsed)
                    .is_ok())
            }
        }
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Plain(v) => write!(f, "{v}"),
            Credential::Sha256(v) => write!(f, "sha256:{v}"),
            Credential::Argon2(v) => write!(f, "argon2:{v}"),
        }
    }
}

impl Default for Credential {
    fn default() -> Self {
        Credential::Plain(String::new())
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Credential::parse(&raw))
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Credential verification errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed sha256 credential: {0}")]
    MalformedSha256(String),

    #[error("malformed argon2 credential: {0}")]
    MalformedArgon2(String),
}
