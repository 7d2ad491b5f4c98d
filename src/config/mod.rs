pub mod loader;
pub mod watcher;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::load;
pub use watcher::watch;

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8080"
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Enable HTTP/2 cleartext (h2c) on the listener
    #[serde(default)]
    pub http2: bool,

    /// Reload configuration when the file changes
    #[serde(default)]
    pub hot_reload: bool,

    #[serde(default = "default_rw_timeout", with = "duration")]
    pub read_timeout: Duration,

    #[serde(default = "default_rw_timeout", with = "duration")]
    pub write_timeout: Duration,

    #[serde(default = "default_idle_timeout", with = "duration")]
    pub idle_timeout: Duration,

    #[serde(default)]
    pub max_connections: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            http2: false,
            hot_reload: false,
            read_timeout: default_rw_timeout(),
            write_timeout: default_rw_timeout(),
            idle_timeout: default_idle_timeout(),
            max_connections: 0,
            cors: None,
            tls: None,
        }
    }
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert_file: String,

    #[serde(default)]
    pub key_file: String,

    /// Client CA bundle; presence enables mTLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<String>,

    #[serde(default)]
    pub client_auth: ClientAuth,
}

/// Client certificate requirement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    #[default]
    None,
    Request,
    Require,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allowed_methods: Vec<String>,

    #[serde(default)]
    pub allowed_headers: Vec<String>,

    #[serde(default)]
    pub max_age: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// "stdout" or a file path
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

/// Global authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeyConfig>,
}

/// JWT validation configuration. Only HMAC-SHA256 tokens are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_jwt_header")]
    pub header: String,

    #[serde(default = "default_jwt_prefix")]
    pub prefix: String,

    #[serde(default = "default_true")]
    pub expiry_check: bool,

    #[serde(default)]
    pub validate_roles: bool,

    #[serde(default)]
    pub validate_scopes: bool,
}

/// API key authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_api_key_header")]
    pub header: String,

    #[serde(default)]
    pub keys: Vec<ApiKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub client_id: String,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Token-bucket rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default)]
    pub by: RateLimitKey,
}

/// What a rate-limit bucket is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    #[default]
    Ip,
    ClientId,
}

/// Prometheus exposition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_metrics_path(),
        }
    }
}

/// A single route: matching rule plus policy chain plus upstreams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub name: String,

    pub path: String,

    #[serde(default)]
    pub methods: Vec<String>,

    /// Single-upstream shorthand, normalised into `upstreams` by the loader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    #[serde(default)]
    pub upstreams: Vec<Upstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancingConfig>,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub strip_path: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RouteAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformConfig>,

    /// Static headers added to every forwarded request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

/// Wire protocol a route forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Ws,
    Wss,
    Grpc,
}

impl Protocol {
    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Grpc => "grpc",
        }
    }
}

/// A backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,

    #[serde(default)]
    pub weight: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
}

/// Load balancing configuration for a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_health_interval", with = "duration")]
    pub health_check_interval: Duration,

    #[serde(default = "default_health_timeout", with = "duration")]
    pub health_check_timeout: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            health_check_interval: default_health_interval(),
            health_check_timeout: default_health_timeout(),
        }
    }
}

/// Upstream selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    #[serde(alias = "round-robin")]
    RoundRobin,
    Weighted,
    #[serde(alias = "least-connections")]
    LeastConnections,
    #[serde(alias = "ip-hash")]
    IpHash,
}

/// Per-route authentication and authorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAuth {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub allowed_roles: Vec<String>,

    #[serde(default)]
    pub required_scopes: Vec<String>,

    #[serde(default)]
    pub permissions: Vec<Permission>,

    #[serde(default)]
    pub require_client_cert: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cert_to_role_mapping: HashMap<String, String>,

    /// Ordered fallback list, e.g. ["client_cert", "jwt"]; first success wins
    #[serde(default)]
    pub require_either: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Jwt,
    ApiKey,
    Mtls,
    #[default]
    None,
}

/// One row of the permission matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_type: Option<String>,

    pub methods: Vec<String>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_reset_timeout", with = "duration")]
    pub reset_timeout: Duration,

    #[serde(default = "default_half_open_max")]
    pub half_open_max_reqs: u32,
}

/// Response cache configuration.
///
/// The cache key covers method and URL only; responses that vary on request
/// headers (Authorization, Accept-Encoding) must not be placed behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl", with = "duration")]
    pub ttl: Duration,

    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,
}

/// Header transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<TransformRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<TransformRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRule {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub add_headers: HashMap<String, String>,

    #[serde(default)]
    pub remove_headers: Vec<String>,
}

/// Outbound call deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect: Duration,

    #[serde(default = "default_rw_timeout", with = "duration")]
    pub read: Duration,

    #[serde(default = "default_rw_timeout", with = "duration")]
    pub write: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_rw_timeout(),
            write: default_rw_timeout(),
        }
    }
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_rw_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_jwt_header() -> String {
    "Authorization".to_string()
}

fn default_jwt_prefix() -> String {
    "Bearer ".to_string()
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rps() -> u32 {
    100
}

fn default_burst() -> u32 {
    100
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_half_open_max() -> u32 {
    3
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

/// Serde support for durations written as "10s", "500ms", "1m" or a bare
/// number of seconds.
pub mod duration {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a duration like \"10s\", \"500ms\" or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                if v < 0 {
                    return Err(de::Error::custom("duration cannot be negative"));
                }
                Ok(Duration::from_secs(v as u64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
                if v < 0.0 {
                    return Err(de::Error::custom("duration cannot be negative"));
                }
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse(v).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }

    pub fn parse(input: &str) -> Result<Duration, String> {
        let s = input.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let value: f64 = num
            .parse()
            .map_err(|_| format!("invalid duration: {input}"))?;

        let secs = match unit.trim() {
            "" | "s" => value,
            "ms" => value / 1_000.0,
            "m" => value * 60.0,
            "h" => value * 3_600.0,
            other => return Err(format!("unknown duration unit: {other}")),
        };

        Ok(Duration::from_secs_f64(secs))
    }

}
