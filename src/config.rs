//! Configuration for the relay/recorder
//!
//! Configuration can be loaded from a TOML file and/or environment
//! variables. Every field carries a default so a minimal file (or none at
//! all) yields a runnable instance.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::auth::credential::Credential;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-path configuration, keyed by path name
    #[serde(default)]
    pub paths: BTreeMap<String, PathConf>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(addr) = std::env::var("STREAMGATE_AUTH_HTTP_ADDRESS") {
            config.auth.method = AuthMethod::Http;
            config.auth.http_address = addr;
        }
        if let Ok(url) = std::env::var("STREAMGATE_AUTH_JWT_JWKS_URL") {
            config.auth.method = AuthMethod::Jwt;
            config.auth.jwt_jwks_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Self::from_env()
    }

    /// Validate cross-field constraints that must be fatal at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.validate()?;
        for (name, path) in &self.paths {
            path.validate(name)?;
        }
        Ok(())
    }
}

/// Authentication backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Embedded user table
    Internal,

    /// External HTTP webhook
    Http,

    /// JWT validated against a JWKS endpoint
    Jwt,
}

/// RTSP authentication algorithms offered to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspAuthMethod {
    Basic,
    DigestMd5,
    DigestSha256,
}

/// Actions a request can be authorized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    Publish,
    Read,
    Playback,
    Api,
    Metrics,
    Pprof,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Publish => "publish",
            AuthAction::Read => "read",
            AuthAction::Playback => "playback",
            AuthAction::Api => "api",
            AuthAction::Metrics => "metrics",
            AuthAction::Pprof => "pprof",
        }
    }
}

impl std::fmt::Display for AuthAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(action, path pattern)` grant
///
/// The pattern is a literal path name, or a regular expression when
/// prefixed with `~`. The empty pattern matches every path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub action: AuthAction,

    #[serde(default)]
    pub path: String,
}

impl Permission {
    /// Whether this grant covers the given action and path
    pub fn matches(&self, action: AuthAction, path: &str) -> bool {
        if self.action != action {
            return false;
        }
        if self.path.is_empty() {
            return true;
        }
        if let Some(pattern) = self.path.strip_prefix('~') {
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(path),
                Err(_) => false,
            }
        } else {
            self.path == path
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(pattern) = self.path.strip_prefix('~') {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("invalid permission regexp '{}': {}", self.path, e))
            })?;
        }
        Ok(())
    }
}

/// One entry of the internal user table
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InternalUser {
    /// Username credential; empty plaintext together with an empty
    /// plaintext pass accepts anonymous requests
    #[serde(default)]
    pub user: Credential,

    /// Password credential
    #[serde(default)]
    pub pass: Credential,

    /// Source networks this user may connect from; empty means any
    #[serde(default)]
    pub ips: Vec<IpNetwork>,

    /// Grants held by this user
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_method")]
    pub method: AuthMethod,

    /// User table for the internal method
    #[serde(default = "default_internal_users")]
    pub internal_users: Vec<InternalUser>,

    /// Webhook URL for the http method
    #[serde(default)]
    pub http_address: String,

    /// Grants for which authentication is skipped entirely
    #[serde(default)]
    pub http_exclude: Vec<Permission>,

    /// JWKS endpoint for the jwt method
    #[serde(default)]
    pub jwt_jwks_url: String,

    /// RTSP challenge algorithms; empty disables RTSP digest handling
    #[serde(default)]
    pub rtsp_auth_methods: Vec<RtspAuthMethod>,
}

fn default_auth_method() -> AuthMethod {
    AuthMethod::Internal
}

fn default_internal_users() -> Vec<InternalUser> {
    // anonymous user allowed to publish and read everything
    vec![InternalUser {
        user: Credential::default(),
        pass: Credential::default(),
        ips: Vec::new(),
        permissions: vec![
            Permission {
                action: AuthAction::Publish,
                path: String::new(),
            },
            Permission {
                action: AuthAction::Read,
                path: String::new(),
            },
            Permission {
                action: AuthAction::Playback,
                path: String::new(),
            },
        ],
    }]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: default_auth_method(),
            internal_users: default_internal_users(),
            http_address: String::new(),
            http_exclude: Vec::new(),
            jwt_jwks_url: String::new(),
            rtsp_auth_methods: Vec::new(),
        }
    }
}

impl AuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.method {
            AuthMethod::Internal => {}
            AuthMethod::Http => {
                if self.http_address.is_empty() {
                    return Err(ConfigError::Invalid(
                        "auth method 'http' requires http_address".into(),
                    ));
                }
            }
            AuthMethod::Jwt => {
                if self.jwt_jwks_url.is_empty() {
                    return Err(ConfigError::Invalid(
                        "auth method 'jwt' requires jwt_jwks_url".into(),
                    ));
                }
            }
        }
        for user in &self.internal_users {
            for perm in &user.permissions {
                perm.validate()?;
            }
        }
        for perm in &self.http_exclude {
            perm.validate()?;
        }
        Ok(())
    }
}

/// Per-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConf {
    /// Pull-mode source URL (`rtmp://`, `rtmps://` or `srt://`); absent
    /// for paths fed by inbound publishers
    #[serde(default)]
    pub source: Option<String>,

    /// Hex SHA-256 fingerprint of the upstream TLS certificate; when set,
    /// certificate verification pins to it and skips the system roots
    #[serde(default)]
    pub source_fingerprint: String,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,

    /// Whether to record this path to disk
    #[serde(default)]
    pub record: bool,

    /// Segment filename template; placeholders: `%path`, `%Y` `%m` `%d`
    /// `%H` `%M` `%S`, `%f` (microseconds), `%s` (sequence number)
    #[serde(default = "default_record_path")]
    pub record_path: String,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_seconds: u64,

    #[serde(default = "default_part_duration")]
    pub part_duration_seconds: f64,
}

fn default_read_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    10
}

fn default_record_path() -> String {
    "./recordings/%path/%Y-%m-%d_%H-%M-%S-%f".to_string()
}

fn default_segment_duration() -> u64 {
    3600
}

fn default_part_duration() -> f64 {
    1.0
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: None,
            source_fingerprint: String::new(),
            read_timeout_seconds: default_read_timeout(),
            write_timeout_seconds: default_write_timeout(),
            record: false,
            record_path: default_record_path(),
            segment_duration_seconds: default_segment_duration(),
            part_duration_seconds: default_part_duration(),
        }
    }
}

impl PathConf {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_seconds)
    }

    pub fn part_duration(&self) -> Duration {
        Duration::from_secs_f64(self.part_duration_seconds)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if let Some(source) = &self.source {
            let url = url::Url::parse(source).map_err(|e| {
                ConfigError::Invalid(format!("path '{}': invalid source URL: {}", name, e))
            })?;
            match url.scheme() {
                "rtmp" | "rtmps" => {}
                "srt" => {
                    if url.port().is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "path '{}': srt source requires an explicit port",
                            name
                        )));
                    }
                }
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "path '{}': unsupported source scheme '{}'",
                        name, other
                    )));
                }
            }
        }
        if !self.source_fingerprint.is_empty() {
            let decoded = hex::decode(&self.source_fingerprint).map_err(|e| {
                ConfigError::Invalid(format!("path '{}': invalid source_fingerprint: {}", name, e))
            })?;
            if decoded.len() != 32 {
                return Err(ConfigError::Invalid(format!(
                    "path '{}': source_fingerprint must be a SHA-256 digest",
                    name
                )));
            }
        }
        if self.record && self.record_path.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "path '{}': record enabled with empty record_path",
                name
            )));
        }
        if self.part_duration_seconds <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "path '{}': part_duration_seconds must be positive",
                name
            )));
        }
        Ok(())
    }
}

/// A CIDR block
///
/// IPv4-mapped IPv6 addresses are canonicalized on both sides of the
/// membership test so `::ffff:127.0.0.1` matches an IPv4 rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

impl IpNetwork {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => {
                let addr: IpAddr = a
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("invalid CIDR '{}': {}", s, e)))?;
                let prefix: u8 = p
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("invalid CIDR '{}': {}", s, e)))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("invalid CIDR '{}': {}", s, e)))?;
                let prefix = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, prefix)
            }
        };

        let addr = canonical(addr);
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(ConfigError::Invalid(format!(
                "invalid CIDR '{}': prefix {} out of range",
                s, prefix
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// Whether the address falls inside this block
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl<'de> Deserialize<'de> for IpNetwork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        IpNetwork::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for IpNetwork {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
