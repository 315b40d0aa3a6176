//! JWT token validation against a JWKS endpoint
//!
//! Tokens are validated for signature and expiration; the permission list
//! is carried in a custom `streamgate_permissions` claim and evaluated
//! with the same matching algorithm as the internal user table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::Permission;

/// How long a fetched key set stays fresh
const JWKS_TTL: Duration = Duration::from_secs(15 * 60);

/// Claims expected in an access token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Expiration timestamp (Unix epoch); enforced by the decoder
    #[allow(dead_code)]
    pub exp: i64,

    /// Permissions granted to the bearer
    #[serde(default)]
    pub streamgate_permissions: Vec<Permission>,
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// JWT validator backed by a lazily fetched, cached JWKS
pub struct JwtBackend {
    jwks_url: String,
    client: reqwest::Client,
    cache: Mutex<Option<CachedKeys>>,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

impl JwtBackend {
    pub fn new(jwks_url: String, client: reqwest::Client) -> Self {
        Self {
            jwks_url,
            client,
            cache: Mutex::new(None),
        }
    }

    /// Validate a token and return the permissions it grants
    pub async fn validate(&self, token: &str) -> Result<Vec<Permission>, JwtError> {
        let header =
            decode_header(token).map_err(|e| JwtError::InvalidFormat(e.to_string()))?;
        let kid = header.kid.ok_or_else(|| {
            JwtError::InvalidFormat("token header carries no kid".to_string())
        })?;

        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;

        let data = decode::<TokenClaims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::InvalidSignature,
                _ => JwtError::InvalidFormat(e.to_string()),
            }
        })?;

        Ok(data.claims.streamgate_permissions)
    }

    /// Look up a decoding key, refetching the JWKS when the cache is cold,
    /// stale, or does not know the kid
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, JwtError> {
        let mut cache = self.cache.lock().await;

        let stale = match cache.as_ref() {
            Some(c) => c.fetched_at.elapsed() > JWKS_TTL || !c.keys.contains_key(kid),
            None => true,
        };

        if stale {
            let jwks: Jwks = self
                .client
                .get(&self.jwks_url)
                .send()
                .await
                .map_err(|e| JwtError::JwksFetch(e.to_string()))?
                .json()
                .await
                .map_err(|e| JwtError::JwksFetch(e.to_string()))?;

            let mut keys = HashMap::new();
            for jwk in jwks.keys {
                if jwk.kty != "RSA" {
                    continue;
                }
                if let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) {
                    match DecodingKey::from_rsa_components(&n, &e) {
                        Ok(key) => {
                            keys.insert(kid, key);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping unusable JWK");
                        }
                    }
                }
            }
            *cache = Some(CachedKeys {
                keys,
                fetched_at: Instant::now(),
            });
        }

        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| JwtError::UnknownKey(kid.to_string()))
    }
}

/// JWT validation errors
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token has expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("no key with kid '{0}' in JWKS")]
    UnknownKey(String),

    #[error("JWKS fetch failed: {0}")]
    JwksFetch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_deserialization() {
        let json = r#"{
            "exp": 4102444800,
            "streamgate_permissions": [
                { "action": "publish", "path": "mypath" },
                { "action": "read" }
            ]
        }"#;

        let claims: TokenClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.streamgate_permissions.len(), 2);
        assert_eq!(claims.streamgate_permissions[0].path, "mypath");
        assert!(claims.streamgate_permissions[1].path.is_empty());
    }

    #[test]
    fn test_claims_without_permissions() {
        let claims: TokenClaims = serde_json::from_str(r#"{"exp": 4102444800}"#).unwrap();
        assert!(claims.streamgate_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let backend = JwtBackend::new(
            "http://127.0.0.1:1/jwks.json".to_string(),
            reqwest::Client::new(),
        );
        let result = backend.validate("not-a-jwt").await;
        assert!(matches!(result, Err(JwtError::InvalidFormat(_))));
    }
}
