//! Authentication manager
//!
//! Decides whether a request is allowed under the configured policy.
//! Three backends are supported: an embedded user table, an external HTTP
//! webhook, and JWT validation against a JWKS endpoint. The manager is
//! stateless across calls; the internal user table can be hot-swapped
//! during configuration reloads without disturbing in-flight requests.

pub mod credential;
pub mod jwt;
pub mod rtsp;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::json;

use crate::config::{AuthAction, AuthConfig, AuthMethod, InternalUser, Permission, RtspAuthMethod};
use jwt::JwtBackend;
use rtsp::RtspRequest;

/// Timeout applied to webhook and JWKS requests
const BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol a request arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rtsp,
    Rtmp,
    Rtmps,
    Hls,
    Srt,
    WebRtc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rtsp => "rtsp",
            Protocol::Rtmp => "rtmp",
            Protocol::Rtmps => "rtmps",
            Protocol::Hls => "hls",
            Protocol::Srt => "srt",
            Protocol::WebRtc => "webrtc",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authentication request; immutable once submitted
#[derive(Debug, Clone)]
pub struct Request {
    pub user: String,
    pub pass: String,
    pub ip: IpAddr,
    pub action: AuthAction,
    pub path: String,
    pub protocol: Protocol,
    pub query: String,

    /// Session identifier forwarded to the webhook; empty on the first
    /// request of a session, the issued id afterwards
    pub id: String,

    /// RTSP envelope, when the request arrived over RTSP and the client
    /// answered a challenge
    pub rtsp_request: Option<RtspRequest>,

    /// Nonce previously issued to this RTSP session
    pub rtsp_nonce: String,
}

impl Request {
    fn credentials_provided(&self) -> bool {
        !self.user.is_empty()
            || !self.pass.is_empty()
            || self
                .rtsp_request
                .as_ref()
                .is_some_and(|r| r.authorization.is_some())
    }
}

/// Authentication errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials missing or mismatched; maps to 401
    #[error("authentication failed")]
    Unauthorized,

    /// Authenticated but not permitted; maps to 403
    #[error("access forbidden")]
    Forbidden,

    /// The backend cannot work as configured; fatal at startup
    #[error("authentication backend misconfigured: {0}")]
    BackendMisconfig(String),
}

/// The authentication manager
pub struct Manager {
    method: AuthMethod,
    internal_users: RwLock<Arc<Vec<InternalUser>>>,
    http_address: String,
    http_exclude: Vec<Permission>,
    rtsp_auth_methods: Vec<RtspAuthMethod>,
    client: reqwest::Client,
    jwt: Option<JwtBackend>,
    misconfig_logged: AtomicBool,
}

impl Manager {
    /// Build a manager from configuration
    ///
    /// Backend requirements (webhook address, JWKS URL) are checked here;
    /// a violation is fatal to the process.
    pub fn new(cfg: &AuthConfig) -> Result<Self, AuthError> {
        match cfg.method {
            AuthMethod::Internal => {}
            AuthMethod::Http => {
                if cfg.http_address.is_empty() {
                    return Err(AuthError::BackendMisconfig(
                        "http method requires an address".to_string(),
                    ));
                }
            }
            AuthMethod::Jwt => {
                if cfg.jwt_jwks_url.is_empty() {
                    return Err(AuthError::BackendMisconfig(
                        "jwt method requires a JWKS URL".to_string(),
                    ));
                }
            }
        }

        let client = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()
            .map_err(|e| AuthError::BackendMisconfig(e.to_string()))?;

        let jwt = match cfg.method {
            AuthMethod::Jwt => Some(JwtBackend::new(cfg.jwt_jwks_url.clone(), client.clone())),
            _ => None,
        };

        Ok(Self {
            method: cfg.method,
            internal_users: RwLock::new(Arc::new(cfg.internal_users.clone())),
            http_address: cfg.http_address.clone(),
            http_exclude: cfg.http_exclude.clone(),
            rtsp_auth_methods: cfg.rtsp_auth_methods.clone(),
            client,
            jwt,
            misconfig_logged: AtomicBool::new(false),
        })
    }

    /// Replace the internal user table; in-flight calls keep reading the
    /// snapshot they started with
    pub fn reload_internal_users(&self, users: Vec<InternalUser>) {
        *self.internal_users.write().unwrap() = Arc::new(users);
    }

    /// Decide whether the request is allowed
    pub async fn authenticate(&self, req: &Request) -> Result<(), AuthError> {
        // exclusion fast path; no backend is consulted for excluded grants
        if self
            .http_exclude
            .iter()
            .any(|p| p.matches(req.action, &req.path))
        {
            return Ok(());
        }

        match self.method {
            AuthMethod::Internal => self.authenticate_internal(req),
            AuthMethod::Http => self.authenticate_http(req).await,
            AuthMethod::Jwt => self.authenticate_jwt(req).await,
        }
    }

    fn authenticate_internal(&self, req: &Request) -> Result<(), AuthError> {
        let users = self.internal_users.read().unwrap().clone();

        let mut permission_denied = false;
        for user in users.iter() {
            if !user.ips.is_empty() && !user.ips.iter().any(|net| net.contains(req.ip)) {
                continue;
            }
            if !self.credentials_match(user, req)? {
                continue;
            }
            if user
                .permissions
                .iter()
                .any(|p| p.matches(req.action, &req.path))
            {
                return Ok(());
            }
            permission_denied = true;
        }

        if permission_denied {
            return Err(AuthError::Forbidden);
        }
        if req.credentials_provided() {
            Err(AuthError::Unauthorized)
        } else {
            Err(AuthError::Forbidden)
        }
    }

    fn credentials_match(&self, user: &InternalUser, req: &Request) -> Result<bool, AuthError> {
        // both credentials empty plaintext: the user accepts anonymous
        // requests, whatever was supplied
        if user.user.is_empty_plain() && user.pass.is_empty_plain() {
            return Ok(true);
        }

        let result = match (&req.rtsp_request, self.rtsp_auth_methods.is_empty()) {
            (Some(rtsp_req), false) => rtsp::validate(
                rtsp_req,
                &user.user,
                &user.pass,
                &req.rtsp_nonce,
                &self.rtsp_auth_methods,
            ),
            _ => user
                .user
                .check(&req.user)
                .and_then(|ok| Ok(ok && user.pass.check(&req.pass)?)),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(e) => {
                if !self.misconfig_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(error = %e, "stored credential is malformed");
                }
                Err(AuthError::Forbidden)
            }
        }
    }

    async fn authenticate_http(&self, req: &Request) -> Result<(), AuthError> {
        let body = json!({
            "ip": req.ip.to_string(),
            "user": req.user,
            "password": req.pass,
            "path": req.path,
            "protocol": req.protocol.as_str(),
            "id": req.id,
            "action": req.action.as_str(),
            "query": req.query,
        });

        // any failure denies; there is no backend-unavailable escape hatch
        match self
            .client
            .post(&self.http_address)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "webhook denied request");
                Err(AuthError::Unauthorized)
            }
            Err(e) => {
                tracing::debug!(error = %e, "webhook unreachable");
                Err(AuthError::Unauthorized)
            }
        }
    }

    async fn authenticate_jwt(&self, req: &Request) -> Result<(), AuthError> {
        let jwt = self
            .jwt
            .as_ref()
            .ok_or_else(|| AuthError::BackendMisconfig("jwt backend not built".to_string()))?;

        let token = extract_jwt(req).ok_or(AuthError::Unauthorized)?;

        let permissions = match jwt.validate(token).await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "jwt validation failed");
                return Err(AuthError::Unauthorized);
            }
        };

        if permissions
            .iter()
            .any(|p| p.matches(req.action, &req.path))
        {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

/// Pull the JWT out of the request: `jwt` query parameter, else the
/// password field
fn extract_jwt(req: &Request) -> Option<&str> {
    for pair in req.query.split('&') {
        if let Some(token) = pair.strip_prefix("jwt=") {
            if !token.is_empty() {
                return Some(token);
            }
        }
    }
    if !req.pass.is_empty() {
        return Some(&req.pass);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpNetwork;
    use credential::Credential;
    use std::sync::atomic::AtomicBool;

    fn single_user_config(user: &str, pass: &str) -> AuthConfig {
        AuthConfig {
            method: AuthMethod::Internal,
            internal_users: vec![InternalUser {
                user: Credential::parse(user),
                pass: Credential::parse(pass),
                ips: vec![IpNetwork::parse("127.1.1.1/32").unwrap()],
                permissions: vec![Permission {
                    action: AuthAction::Publish,
                    path: "mypath".into(),
                }],
            }],
            http_address: String::new(),
            http_exclude: Vec::new(),
            jwt_jwks_url: String::new(),
            rtsp_auth_methods: Vec::new(),
        }
    }

    fn request() -> Request {
        Request {
            user: "testuser".into(),
            pass: "testpass".into(),
            ip: "127.1.1.1".parse().unwrap(),
            action: AuthAction::Publish,
            path: "mypath".into(),
            protocol: Protocol::Rtsp,
            query: String::new(),
            id: String::new(),
            rtsp_request: None,
            rtsp_nonce: String::new(),
        }
    }

    #[tokio::test]
    async fn test_internal() {
        let encodings = [
            ("testuser", "testpass"),
            (
                "sha256:rl3rgi4NcZkpAEcacZnQ2VuOfJ0FxAqCRaKB/SwdZoQ=",
                "sha256:E9JJ8stBJ7QM+nV4ZoUCeHk/gU3tPFh/5YieiJp6n2w=",
            ),
            (
                "argon2:$argon2id$v=19$m=4096,t=3,p=1$MTIzNDU2Nzg$Ux/LWeTgJQPyfMMJo1myR64+o8rALHoPmlE1i/TR+58",
                "argon2:$argon2i$v=19$m=4096,t=3,p=1$MTIzNDU2Nzg$/mrZ42TiTv1mcPnpMUera5oi0SFYbbyueAbdx5sUvWo",
            ),
        ];

        for (stored_user, stored_pass) in encodings {
            let m = Manager::new(&single_user_config(stored_user, stored_pass)).unwrap();

            // ok
            assert_eq!(m.authenticate(&request()).await, Ok(()));

            // wrong user
            let mut req = request();
            req.user = "wrong".into();
            assert_eq!(m.authenticate(&req).await, Err(AuthError::Unauthorized));

            // wrong pass
            let mut req = request();
            req.pass = "wrong".into();
            assert_eq!(m.authenticate(&req).await, Err(AuthError::Unauthorized));

            // wrong ip
            let mut req = request();
            req.ip = "127.1.1.2".parse().unwrap();
            assert_eq!(m.authenticate(&req).await, Err(AuthError::Unauthorized));

            // wrong action: credentials match, permission does not
            let mut req = request();
            req.action = AuthAction::Read;
            assert_eq!(m.authenticate(&req).await, Err(AuthError::Forbidden));

            // wrong path
            let mut req = request();
            req.path = "wrong".into();
            assert_eq!(m.authenticate(&req).await, Err(AuthError::Forbidden));
        }
    }

    #[tokio::test]
    async fn test_internal_anonymous_user() {
        let mut cfg = single_user_config("", "");
        cfg.internal_users[0].ips.clear();
        let m = Manager::new(&cfg).unwrap();

        let mut req = request();
        req.user = String::new();
        req.pass = String::new();
        assert_eq!(m.authenticate(&req).await, Ok(()));
    }

    #[tokio::test]
    async fn test_internal_no_credentials_is_forbidden() {
        let m = Manager::new(&single_user_config("testuser", "testpass")).unwrap();

        let mut req = request();
        req.user = String::new();
        req.pass = String::new();
        assert_eq!(m.authenticate(&req).await, Err(AuthError::Forbidden));
    }

    #[tokio::test]
    async fn test_internal_malformed_stored_hash() {
        let m = Manager::new(&single_user_config("sha256:!!!", "testpass")).unwrap();
        assert_eq!(m.authenticate(&request()).await, Err(AuthError::Forbidden));
    }

    #[tokio::test]
    async fn test_internal_rtsp_digest() {
        let mut cfg = single_user_config("myuser", "mypass");
        cfg.rtsp_auth_methods = vec![RtspAuthMethod::DigestMd5];
        let m = Manager::new(&cfg).unwrap();

        let uri = "rtsp://127.0.0.1:8554/mypath";
        let mut req = request();
        req.user = String::new();
        req.pass = String::new();
        req.rtsp_nonce = "mynonce".into();
        req.rtsp_request = Some(RtspRequest {
            method: "ANNOUNCE".into(),
            url: uri.into(),
            authorization: Some(rtsp::digest_authorization(
                "MD5", "myuser", "mypass", "mynonce", "ANNOUNCE", uri,
            )),
        });

        assert_eq!(m.authenticate(&req).await, Ok(()));

        // stale nonce
        let mut bad = req.clone();
        bad.rtsp_nonce = "other".into();
        assert_eq!(m.authenticate(&bad).await, Err(AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn test_user_table_hot_swap() {
        let m = Manager::new(&single_user_config("testuser", "testpass")).unwrap();
        assert_eq!(m.authenticate(&request()).await, Ok(()));

        m.reload_internal_users(vec![InternalUser {
            user: Credential::parse("otheruser"),
            pass: Credential::parse("otherpass"),
            ips: Vec::new(),
            permissions: vec![Permission {
                action: AuthAction::Publish,
                path: "mypath".into(),
            }],
        }]);

        assert_eq!(
            m.authenticate(&request()).await,
            Err(AuthError::Unauthorized)
        );

        let mut req = request();
        req.user = "otheruser".into();
        req.pass = "otherpass".into();
        assert_eq!(m.authenticate(&req).await, Ok(()));
    }

    async fn spawn_webhook(expected_user: &'static str) -> u16 {
        use axum::{http::StatusCode, routing::post, Json, Router};

        let first_received = Arc::new(AtomicBool::new(false));
        let app = Router::new().route(
            "/auth",
            post(move |Json(body): Json<serde_json::Value>| {
                let first_received = first_received.clone();
                async move {
                    let field = |k: &str| body[k].as_str().unwrap_or_default().to_string();
                    let id_ok =
                        !first_received.load(Ordering::SeqCst) || !field("id").is_empty();
                    if field("ip") == "127.0.0.1"
                        && field("user") == expected_user
                        && field("password") == "testpass"
                        && field("path") == "teststream"
                        && field("protocol") == "rtsp"
                        && field("action") == "publish"
                        && field("query") == "param=value"
                        && id_ok
                    {
                        first_received.store(true, Ordering::SeqCst);
                        StatusCode::OK
                    } else {
                        StatusCode::BAD_REQUEST
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_http_webhook() {
        let port = spawn_webhook("testpublisher").await;

        let cfg = AuthConfig {
            method: AuthMethod::Http,
            internal_users: Vec::new(),
            http_address: format!("http://127.0.0.1:{port}/auth"),
            http_exclude: Vec::new(),
            jwt_jwks_url: String::new(),
            rtsp_auth_methods: Vec::new(),
        };
        let m = Manager::new(&cfg).unwrap();

        let mut req = request();
        req.user = "testpublisher".into();
        req.ip = "127.0.0.1".parse().unwrap();
        req.path = "teststream".into();
        req.query = "param=value".into();
        assert_eq!(m.authenticate(&req).await, Ok(()));

        // subsequent request of the same session carries the issued id
        req.id = "5c9a8f2b".into();
        assert_eq!(m.authenticate(&req).await, Ok(()));

        // denied user
        let mut bad = req.clone();
        bad.user = "invalid".into();
        assert_eq!(m.authenticate(&bad).await, Err(AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn test_http_exclude_skips_webhook() {
        // the address is unreachable on purpose; authentication must
        // succeed without any webhook call
        let cfg = AuthConfig {
            method: AuthMethod::Http,
            internal_users: Vec::new(),
            http_address: "http://not-to-be-used:9120/auth".into(),
            http_exclude: vec![Permission {
                action: AuthAction::Publish,
                path: String::new(),
            }],
            jwt_jwks_url: String::new(),
            rtsp_auth_methods: Vec::new(),
        };
        let m = Manager::new(&cfg).unwrap();

        let mut req = request();
        req.user = String::new();
        req.pass = String::new();
        req.ip = "127.0.0.1".parse().unwrap();
        req.path = "teststream".into();
        req.query = "param=value".into();
        assert_eq!(m.authenticate(&req).await, Ok(()));

        // a non-excluded action still hits the webhook and is denied
        let mut read = req.clone();
        read.action = AuthAction::Read;
        assert_eq!(m.authenticate(&read).await, Err(AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn test_backend_requirements_fatal() {
        let cfg = AuthConfig {
            method: AuthMethod::Http,
            internal_users: Vec::new(),
            http_address: String::new(),
            http_exclude: Vec::new(),
            jwt_jwks_url: String::new(),
            rtsp_auth_methods: Vec::new(),
        };
        assert!(matches!(
            Manager::new(&cfg),
            Err(AuthError::BackendMisconfig(_))
        ));
    }

    #[test]
    fn test_extract_jwt() {
        let mut req = request();
        req.query = "a=1&jwt=token123&b=2".into();
        assert_eq!(extract_jwt(&req), Some("token123"));

        req.query = String::new();
        req.pass = "fromfield".into();
        assert_eq!(extract_jwt(&req), Some("fromfield"));

        req.pass = String::new();
        assert_eq!(extract_jwt(&req), None);
    }
}
