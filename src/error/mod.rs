use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Circuit open for route {0}")]
    CircuitOpen(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Load balancer error: {0}")]
    LoadBalancerError(#[from] LoadBalancerError),

    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Proxy error: {0}")]
    ProxyError(#[from] ProxyError),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// HTTP status code mapping for gateway errors
impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::AuthenticationFailed(_) => 401,
            GatewayError::AuthorizationFailed(_) => 403,
            GatewayError::RateLimitExceeded => 429,
            GatewayError::CircuitOpen(_) => 503,
            GatewayError::UpstreamUnavailable(_) => 502,
            GatewayError::RequestTimeout => 504,
            GatewayError::CacheError(_) => 500,
            GatewayError::ConfigError(_) => 500,
            GatewayError::LoadBalancerError(_) => 503,
            GatewayError::AuthError(_) => 401,
            GatewayError::ProxyError(e) => e.status_code(),
            GatewayError::InternalError(_) => 500,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::IoError(_) => 500,
        }
    }
}

/// Authentication specific errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials provided")]
    MissingCredentials,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("unexpected signing algorithm")]
    UnexpectedAlgorithm,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("client certificate required")]
    CertificateRequired,

    #[error("authentication misconfigured: {0}")]
    Misconfigured(String),
}

/// Cache specific errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to store item in cache: {0}")]
    StoreError(String),

    #[error("failed to retrieve item from cache: {0}")]
    RetrieveError(String),
}

/// Load balancer specific errors
#[derive(Debug, Error)]
pub enum LoadBalancerError {
    #[error("no upstreams configured")]
    NoUpstreams,

    #[error("invalid upstream URL {0}: {1}")]
    InvalidUpstreamUrl(String, String),

    #[error("invalid load balancing strategy: {0}")]
    InvalidStrategy(String),

    #[error("failed to build health prober: {0}")]
    ProbeClient(String),
}

/// Proxy/forwarder specific errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream connection failed: {0}")]
    ConnectFailed(String),

    #[error("upstream request failed: {0}")]
    UpstreamFailed(String),

    #[error("gRPC requires HTTP/2")]
    GrpcRequiresHttp2,

    #[error("invalid gRPC request content-type")]
    GrpcInvalidContentType,

    #[error("invalid gRPC frame: {0}")]
    GrpcBadFrame(String),

    #[error("websocket upgrade failed: {0}")]
    WebSocketUpgradeFailed(String),
}

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::ConnectFailed(_) | ProxyError::UpstreamFailed(_) => 502,
            ProxyError::GrpcRequiresHttp2 => 505,
            ProxyError::GrpcInvalidContentType => 415,
            ProxyError::GrpcBadFrame(_) => 400,
            ProxyError::WebSocketUpgradeFailed(_) => 502,
        }
    }
}

/// Configuration specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(String),

    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),

    #[error("failed to watch configuration file: {0}")]
    WatchError(String),
}
