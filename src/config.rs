//! Configuration management for Bulwark.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `BULWARK__SECTION__FIELD` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::Tier;

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Request content validation
    #[serde(default)]
    pub content: ContentConfig,

    /// Security response headers
    #[serde(default)]
    pub headers: HeadersConfig,

    /// Reverse proxy handling
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// API key identities
    #[serde(default)]
    pub auth: AuthConfig,

    /// DDoS heuristics
    #[serde(default)]
    pub ddos: DdosConfig,

    /// HMAC request signatures
    #[serde(default)]
    pub signature: SignatureConfig,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Test,
    Staging,
    Production,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            environment: Environment::default(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// Where rate limit counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// One process; counters in memory.
    #[default]
    Local,
    /// Several processes or nodes; counters in the shared store.
    Distributed,
}

/// Behavior when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local or distributed counters
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Default requests allowed per primary window
    #[serde(default = "default_per_minute")]
    pub per_minute: u64,

    /// Length of the primary window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests allowed per hour; `None` disables the hourly window
    #[serde(default = "default_per_hour")]
    pub per_hour: Option<u64>,

    /// Extra capacity on top of the primary window limit
    #[serde(default = "default_burst")]
    pub burst: u64,

    /// Per-route overrides, keyed by `"METHOD /path"` or `"/path"`
    #[serde(default)]
    pub routes: HashMap<String, RouteLimit>,

    /// Paths never rate limited
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,

    /// Interval of the background sweep of idle in-memory keys
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Hash client addresses before they become counter keys
    #[serde(default)]
    pub hash_client_keys: bool,

    /// Shared store used in distributed mode
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: DeploymentMode::default(),
            per_minute: default_per_minute(),
            window_secs: default_window_secs(),
            per_hour: default_per_hour(),
            burst: default_burst(),
            routes: HashMap::new(),
            bypass_paths: default_bypass_paths(),
            sweep_interval_secs: default_sweep_interval(),
            hash_client_keys: false,
            store: StoreConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_per_minute() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_per_hour() -> Option<u64> {
    Some(1000)
}

fn default_burst() -> u64 {
    10
}

fn default_bypass_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/health/ready".to_string(),
        "/metrics".to_string(),
    ]
}

fn default_sweep_interval() -> u64 {
    300
}

/// A per-route limit override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLimit {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length; falls back to the default window
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Burst allowance; falls back to the default burst
    #[serde(default)]
    pub burst: Option<u64>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix of every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound of one store round trip
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub fail_mode: FailMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
            fail_mode: FailMode::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_store_timeout() -> u64 {
    250
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Seconds an open circuit waits before admitting a probe
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Path prefixes whose handlers are guarded
    #[serde(default = "default_protected_prefixes")]
    pub protected_prefixes: Vec<String>,

    /// Lowest response status counted as a failure
    #[serde(default = "default_failure_status")]
    pub failure_status: u16,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            protected_prefixes: default_protected_prefixes(),
            failure_status: default_failure_status(),
        }
    }
}

fn default_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_protected_prefixes() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_failure_status() -> u16 {
    500
}

/// Content validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum declared body size per path prefix (longest prefix wins)
    #[serde(default = "default_size_limits")]
    pub size_limits: BTreeMap<String, u64>,

    /// Limit applied when no prefix matches
    #[serde(default = "default_size_limit")]
    pub default_size_limit: u64,

    /// Allowed media types per method; methods not listed accept any type
    #[serde(default = "default_allowed_types")]
    pub allowed_types: HashMap<String, Vec<String>>,

    #[serde(default = "default_true")]
    pub block_null_bytes: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size_limits: default_size_limits(),
            default_size_limit: default_size_limit(),
            allowed_types: default_allowed_types(),
            block_null_bytes: true,
        }
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

fn default_size_limits() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("/api/upload".to_string(), 50 * MIB),
        ("/api/import".to_string(), 10 * MIB),
        ("/api/".to_string(), MIB),
        ("/webhook".to_string(), 256 * KIB),
        ("/graphql".to_string(), 100 * KIB),
    ])
}

fn default_size_limit() -> u64 {
    64 * KIB
}

fn default_allowed_types() -> HashMap<String, Vec<String>> {
    let types = |list: &[&str]| list.iter().map(|t| t.to_string()).collect::<Vec<_>>();
    HashMap::from([
        (
            "POST".to_string(),
            types(&[
                "application/json",
                "application/x-www-form-urlencoded",
                "multipart/form-data",
                "text/plain",
            ]),
        ),
        (
            "PUT".to_string(),
            types(&[
                "application/json",
                "application/octet-stream",
                "multipart/form-data",
            ]),
        ),
        (
            "PATCH".to_string(),
            types(&["application/json", "application/merge-patch+json"]),
        ),
    ])
}

/// Security header configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersConfig {
    #[serde(default = "default_true")]
    pub enable_hsts: bool,

    #[serde(default)]
    pub enable_csp: bool,

    #[serde(default = "default_csp_policy")]
    pub csp_policy: String,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            enable_hsts: true,
            enable_csp: false,
            csp_policy: default_csp_policy(),
        }
    }
}

fn default_csp_policy() -> String {
    "default-src 'self'".to_string()
}

/// Reverse proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Honor `X-Forwarded-*` headers from trusted peers
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Peer addresses whose forwarding headers are believed
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            trust_proxy_headers: false,
            trusted_proxies: default_trusted_proxies(),
        }
    }
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

/// API key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Known keys and the identity they carry
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKeyEntry>,

    /// HS256 secret for bearer tokens; `None` disables token identities
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Cookie consulted when no `Authorization: Bearer` header is present
    #[serde(default = "default_jwt_cookie")]
    pub jwt_cookie: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_api_key_header(),
            api_keys: HashMap::new(),
            jwt_secret: None,
            jwt_cookie: default_jwt_cookie(),
        }
    }
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_jwt_cookie() -> String {
    "access_token".to_string()
}

/// The identity behind one API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub user_id: String,
    #[serde(default)]
    pub tier: Tier,
}

/// DDoS heuristics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Concurrent in-flight requests allowed per address
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u64,

    /// Requests per minute per address before it is blocked
    #[serde(default = "default_ddos_rate")]
    pub max_requests_per_minute: u64,

    /// How long a blocked address stays blocked
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_in_flight: default_max_in_flight(),
            max_requests_per_minute: default_ddos_rate(),
            block_secs: default_block_secs(),
        }
    }
}

fn default_max_in_flight() -> u64 {
    100
}

fn default_ddos_rate() -> u64 {
    1000
}

fn default_block_secs() -> u64 {
    300
}

/// HMAC request signature configuration.
///
/// Signatures are optional per request: only requests that carry both the
/// signature and the timestamp header are verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Shared HMAC-SHA256 secret
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_signature_header")]
    pub header: String,

    #[serde(default = "default_timestamp_header")]
    pub timestamp_header: String,

    /// Largest clock skew accepted between the timestamp and now
    #[serde(default = "default_signature_max_age")]
    pub max_age_secs: u64,

    /// Largest body buffered for verification
    #[serde(default = "default_signature_max_body")]
    pub max_body_bytes: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            header: default_signature_header(),
            timestamp_header: default_timestamp_header(),
            max_age_secs: default_signature_max_age(),
            max_body_bytes: default_signature_max_body(),
        }
    }
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_timestamp_header() -> String {
    "x-timestamp".to_string()
}

fn default_signature_max_age() -> u64 {
    300
}

fn default_signature_max_body() -> usize {
    MIB as usize
}

impl BulwarkConfig {
    /// Load configuration from an optional file plus the environment, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BULWARK")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BulwarkConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BulwarkConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would run with undefined limits.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.per_minute == 0 {
            return Err(invalid("rate_limiting.per_minute must be positive"));
        }
        if rl.window_secs == 0 {
            return Err(invalid("rate_limiting.window_secs must be positive"));
        }
        if rl.per_hour == Some(0) {
            return Err(invalid("rate_limiting.per_hour must be positive when set"));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(invalid("rate_limiting.sweep_interval_secs must be positive"));
        }
        for (key, route) in &rl.routes {
            validate_route_key(key)?;
            if route.limit == 0 {
                return Err(invalid(format!("route override '{key}' has a zero limit")));
            }
            if route.window_secs == Some(0) {
                return Err(invalid(format!("route override '{key}' has a zero window")));
            }
        }
        if rl.mode == DeploymentMode::Distributed
            && rl.store.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(invalid("distributed mode requires rate_limiting.store.url"));
        }
        if rl.store.timeout_ms == 0 {
            return Err(invalid("rate_limiting.store.timeout_ms must be positive"));
        }

        let cb = &self.circuit_breaker;
        if cb.threshold == 0 {
            return Err(invalid("circuit_breaker.threshold must be at least 1"));
        }
        if cb.recovery_timeout_secs == 0 {
            return Err(invalid("circuit_breaker.recovery_timeout_secs must be positive"));
        }
        if !(100..=599).contains(&cb.failure_status) {
            return Err(invalid("circuit_breaker.failure_status is not an HTTP status"));
        }

        for (prefix, limit) in &self.content.size_limits {
            if !prefix.starts_with('/') {
                return Err(invalid(format!("size limit prefix '{prefix}' must start with '/'")));
            }
            if *limit == 0 {
                return Err(invalid(format!("size limit for '{prefix}' must be positive")));
            }
        }
        if self.content.default_size_limit == 0 {
            return Err(invalid("content.default_size_limit must be positive"));
        }

        for proxy in &self.proxy.trusted_proxies {
            proxy
                .parse::<IpAddr>()
                .map_err(|_| invalid(format!("trusted proxy '{proxy}' is not an IP address")))?;
        }

        let ddos = &self.ddos;
        if ddos.max_in_flight == 0 || ddos.max_requests_per_minute == 0 || ddos.block_secs == 0 {
            return Err(invalid("ddos thresholds must be positive"));
        }

        if self.auth.jwt_secret.as_deref().is_some_and(|s| s.is_empty()) {
            return Err(invalid("auth.jwt_secret must not be empty when set"));
        }

        let sig = &self.signature;
        if sig.enabled {
            if sig.secret.as_deref().map_or(true, str::is_empty) {
                return Err(invalid("signature.secret is required when signatures are enabled"));
            }
            if sig.max_age_secs == 0 || sig.max_body_bytes == 0 {
                return Err(invalid("signature limits must be positive"));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> BulwarkError {
    BulwarkError::Config(msg.into())
}

fn validate_route_key(key: &str) -> Result<()> {
    let path = match key.split_once(' ') {
        Some((method, path)) => {
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(invalid(format!("route override '{key}' has an invalid method")));
            }
            path.trim()
        }
        None => key,
    };
    if !path.starts_with('/') {
        return Err(invalid(format!("route override '{key}' must name an absolute path")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BulwarkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limiting.per_minute, 60);
        assert_eq!(config.rate_limiting.per_hour, Some(1000));
        assert_eq!(config.circuit_breaker.threshold, 5);
        assert_eq!(config.content.size_limits["/api/"], 1024 * 1024);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
  environment: production
rate_limiting:
  mode: distributed
  per_minute: 120
  burst: 0
  routes:
    "POST /api/auth/login":
      limit: 5
  store:
    url: "redis://127.0.0.1:6379"
    fail_mode: closed
circuit_breaker:
  enabled: true
  threshold: 3
auth:
  api_keys:
    secret-key:
      user_id: alice
      tier: pro
"#;
        let config = BulwarkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.environment, Environment::Production);
        assert_eq!(config.rate_limiting.mode, DeploymentMode::Distributed);
        assert_eq!(config.rate_limiting.routes["POST /api/auth/login"].limit, 5);
        assert_eq!(config.rate_limiting.store.fail_mode, FailMode::Closed);
        assert_eq!(config.circuit_breaker.threshold, 3);
        assert_eq!(config.auth.api_keys["secret-key"].tier, Tier::Pro);
        // Untouched sections keep their defaults
        assert_eq!(config.rate_limiting.per_hour, Some(1000));
        assert!(config.content.enabled);
    }

    #[test]
    fn test_distributed_requires_store_url() {
        let yaml = r#"
rate_limiting:
  mode: distributed
"#;
        let err = BulwarkConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, BulwarkError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = BulwarkConfig::default();
        config.rate_limiting.per_minute = 0;
        assert!(config.validate().is_err());

        let mut config = BulwarkConfig::default();
        config.circuit_breaker.threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_signature_and_token_settings() {
        let yaml = r#"
auth:
  jwt_secret: s3cret
signature:
  enabled: true
  secret: shared
"#;
        let config = BulwarkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.auth.jwt_cookie, "access_token");
        assert_eq!(config.signature.header, "x-signature");
        assert_eq!(config.signature.max_age_secs, 300);

        let mut config = BulwarkConfig::default();
        config.signature.enabled = true;
        assert!(config.validate().is_err());

        let mut config = BulwarkConfig::default();
        config.auth.jwt_secret = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_route_keys() {
        let mut config = BulwarkConfig::default();
        config.rate_limiting.routes.insert(
            "api/login".to_string(),
            RouteLimit { limit: 5, window_secs: None, burst: None },
        );
        assert!(config.validate().is_err());

        let mut config = BulwarkConfig::default();
        config.rate_limiting.routes.insert(
            "P0ST /api/login".to_string(),
            RouteLimit { limit: 5, window_secs: None, burst: None },
        );
        assert!(config.validate().is_err());

        let mut config = BulwarkConfig::default();
        config.rate_limiting.routes.insert(
            "POST /api/login".to_string(),
            RouteLimit { limit: 5, window_secs: None, burst: None },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_size_table_and_proxies() {
        let mut config = BulwarkConfig::default();
        config.content.size_limits.insert("api".to_string(), 10);
        assert!(config.validate().is_err());

        let mut config = BulwarkConfig::default();
        config.proxy.trusted_proxies.push("not-an-ip".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = BulwarkConfig::from_yaml("rate_limiting: [").unwrap_err();
        assert!(matches!(err, BulwarkError::Config(_)));
    }
}
