use std::sync::Arc;
use std::time::Instant;

use hyper::{Method, StatusCode};
use serde_json::json;
use tracing::info;

use crate::config::{AuthType, GatewayConfig, LoadBalancingConfig, Route};
use crate::core::pipeline::{MiddlewareChain, MiddlewareHandler};
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::lb::LoadBalancer;
use crate::middleware::auth::AuthMiddleware;
use crate::middleware::cache::{CacheManager, CacheMiddleware};
use crate::middleware::circuit_breaker::{CircuitBreakerManager, CircuitBreakerMiddleware};
use crate::middleware::metrics;
use crate::middleware::rate_limit::{RateLimitMiddleware, RateLimiterRegistry};
use crate::middleware::transform::TransformMiddleware;
use crate::proxy::Forwarder;

/// Reserved prefix for the gateway's own endpoints.
const INTERNAL_PREFIX: &str = "/_gonk/";

/// Server-lifetime state shared across dispatcher generations, so breakers,
/// caches and rate-limit buckets survive configuration reloads.
pub struct SharedState {
    pub cache_manager: Arc<CacheManager>,
    pub cb_manager: Arc<CircuitBreakerManager>,
    pub rate_limiter: Arc<RateLimiterRegistry>,
    pub start_time: Instant,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            cache_manager: Arc::new(CacheManager::new()),
            cb_manager: Arc::new(CircuitBreakerManager::new()),
            rate_limiter: Arc::new(RateLimiterRegistry::new()),
            start_time: Instant::now(),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// How specific a pattern is; exact beats any prefix, longer prefixes beat
/// shorter ones, declaration order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone)]
struct PathPattern {
    kind: PatternKind,
    value: String,
}

impl PathPattern {
    fn parse(path: &str) -> Self {
        if let Some(prefix) = path.strip_suffix("/*") {
            Self {
                kind: PatternKind::Prefix,
                value: format!("{prefix}/"),
            }
        } else if path.ends_with('/') && path.len() > 1 {
            Self {
                kind: PatternKind::Prefix,
                value: path.to_string(),
            }
        } else {
            Self {
                kind: PatternKind::Exact,
                value: path.to_string(),
            }
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self.kind {
            // An exact route also answers the trailing-slash variant.
            PatternKind::Exact => {
                path == self.value || path.strip_suffix('/') == Some(&self.value)
            }
            PatternKind::Prefix => path.starts_with(&self.value),
        }
    }

    fn specificity(&self) -> (u8, usize) {
        match self.kind {
            PatternKind::Exact => (0, 0),
            // Longer prefixes sort first within the prefix class.
            PatternKind::Prefix => (1, usize::MAX - self.value.len()),
        }
    }
}

struct RouteEntry {
    name: String,
    pattern: PathPattern,
    methods: Vec<Method>,
    handler: Arc<dyn MiddlewareHandler>,
}

/// Matches requests to routes and serves the reserved internal endpoints.
/// One dispatcher is built per configuration generation and swapped
/// atomically on reload.
pub struct Dispatcher {
    routes: Vec<RouteEntry>,
    balancers: Vec<(String, Arc<LoadBalancer>)>,
    cache_manager: Arc<CacheManager>,
    start_time: Instant,
    metrics_enabled: bool,
    metrics_path: String,
    features: serde_json::Value,
}

impl Dispatcher {
    /// Materialize every route: load balancer, forwarder, and the composed
    /// policy chain (auth → rate limit → breaker → cache → transform).
    pub fn build(config: &GatewayConfig, shared: &SharedState) -> Result<Self, GatewayError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        let mut balancers = Vec::new();

        for (decl, route) in config.routes.iter().enumerate() {
            let (entry, lb) = Self::build_route(route, config, shared)?;
            info!(
                route = %route.name,
                path = %route.path,
                upstreams = route.upstreams.len(),
                protocol = route.protocol.as_str(),
                "route registered"
            );
            balancers.push((route.name.clone(), lb));
            routes.push((decl, entry));
        }

        // Most specific first; declaration order breaks ties (sort is stable).
        routes.sort_by_key(|(decl, entry)| {
            let (class, prefix_rank) = entry.pattern.specificity();
            (class, prefix_rank, *decl)
        });

        let features = json!({
            "metrics": config.metrics.enabled,
            "rate_limiting": config.rate_limit.as_ref().is_some_and(|r| r.enabled)
                || config.routes.iter().any(|r| r.rate_limit.as_ref().is_some_and(|l| l.enabled)),
            "authentication": config.auth.jwt.is_some() || config.auth.api_key.is_some(),
            "authorization": true,
            "mtls": config.server.tls.as_ref().is_some_and(|t| t.client_ca.is_some()),
            "load_balancing": true,
            "caching": true,
            "circuit_breaker": true,
        });

        Ok(Self {
            routes: routes.into_iter().map(|(_, entry)| entry).collect(),
            balancers,
            cache_manager: Arc::clone(&shared.cache_manager),
            start_time: shared.start_time,
            metrics_enabled: config.metrics.enabled,
            metrics_path: config.metrics.path.clone(),
            features,
        })
    }

    fn build_route(
        route: &Route,
        config: &GatewayConfig,
        shared: &SharedState,
    ) -> Result<(RouteEntry, Arc<LoadBalancer>), GatewayError> {
        let lb_config = route.load_balancing.clone().unwrap_or_else(|| {
            LoadBalancingConfig::default()
        });
        let lb = LoadBalancer::new(&route.upstreams, &lb_config)?;

        let forwarder = Forwarder::new(route, Arc::clone(&lb))?;

        let mut chain = MiddlewareChain::new();

        if let Some(auth) = &route.auth {
            if auth.auth_type != AuthType::None {
                chain.add(AuthMiddleware::new(auth.clone(), config.auth.clone()));
            }
        }

        match (&route.rate_limit, &config.rate_limit) {
            (Some(limit), _) if limit.enabled => {
                chain.add(RateLimitMiddleware::new(
                    &route.name,
                    limit.clone(),
                    Arc::clone(&shared.rate_limiter),
                ));
            }
            (None, Some(limit)) if limit.enabled => {
                chain.add(RateLimitMiddleware::new(
                    "global",
                    limit.clone(),
                    Arc::clone(&shared.rate_limiter),
                ));
            }
            _ => {}
        }

        if let Some(cb) = &route.circuit_breaker {
            if cb.enabled {
                let breaker = shared.cb_manager.get_or_create(&route.name, cb);
                chain.add(CircuitBreakerMiddleware::new(breaker));
            }
        }

        if let Some(cache) = &route.cache {
            if cache.enabled {
                let cache = shared.cache_manager.get_or_create(&route.name, cache);
                chain.add(CacheMiddleware::new(cache));
            }
        }

        if let Some(transform) = &route.transform {
            chain.add(TransformMiddleware::new(transform.clone()));
        }

        let handler = chain.build(Arc::new(forwarder));

        let methods = route
            .methods
            .iter()
            .filter_map(|m| m.parse::<Method>().ok())
            .collect();

        Ok((
            RouteEntry {
                name: route.name.clone(),
                pattern: PathPattern::parse(&route.path),
                methods,
                handler,
            },
            lb,
        ))
    }

    /// Process one request to a terminal response. Exactly one response is
    /// produced for every request.
    pub async fn dispatch(&self, request: GatewayRequest) -> GatewayResponse {
        let path = request.uri.path().to_string();

        if path.starts_with(INTERNAL_PREFIX) {
            return self.serve_internal(&path, &request.method);
        }
        if self.metrics_enabled && path == self.metrics_path {
            return self.serve_metrics(&request.method);
        }

        let method = request.method.clone();
        let mut path_matched = false;

        for entry in &self.routes {
            if !entry.pattern.matches(&path) {
                continue;
            }
            path_matched = true;

            if !entry.methods.is_empty() && !entry.methods.contains(&method) {
                continue;
            }

            let started = Instant::now();
            let response = match entry.handler.handle(request).await {
                Ok(response) => response,
                Err(e) => {
                    let status = StatusCode::from_u16(e.status_code())
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    GatewayResponse::error(status, &e.to_string())
                }
            };

            if self.metrics_enabled {
                metrics::record_request(
                    &entry.name,
                    &method,
                    response.status,
                    started.elapsed(),
                );
            }

            return response;
        }

        if path_matched {
            GatewayResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        } else {
            GatewayResponse::error(StatusCode::NOT_FOUND, "route not found")
        }
    }

    fn serve_internal(&self, path: &str, method: &Method) -> GatewayResponse {
        let expected = match path {
            "/_gonk/health" | "/_gonk/live" | "/_gonk/ready" | "/_gonk/info"
            | "/_gonk/cache/stats" => Method::GET,
            "/_gonk/cache/clear" => Method::POST,
            _ => return GatewayResponse::error(StatusCode::NOT_FOUND, "route not found"),
        };
        if *method != expected {
            return GatewayResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        match path {
            "/_gonk/health" => {
                let upstreams: usize = self
                    .balancers
                    .iter()
                    .map(|(_, lb)| lb.stats().total_upstreams)
                    .sum();
                let healthy: usize = self
                    .balancers
                    .iter()
                    .map(|(_, lb)| lb.stats().healthy_upstreams)
                    .sum();
                GatewayResponse::json(
                    StatusCode::OK,
                    &json!({
                        "status": "healthy",
                        "uptime": format!("{}s", self.start_time.elapsed().as_secs()),
                        "upstreams": upstreams,
                        "healthy_upstreams": healthy,
                    }),
                )
            }
            "/_gonk/live" => {
                GatewayResponse::json(StatusCode::OK, &json!({"status": "alive"}))
            }
            "/_gonk/ready" => {
                GatewayResponse::json(StatusCode::OK, &json!({"status": "ready"}))
            }
            "/_gonk/info" => GatewayResponse::json(
                StatusCode::OK,
                &json!({
                    "name": "gonk",
                    "version": env!("CARGO_PKG_VERSION"),
                    "routes": self.routes.len(),
                    "features": self.features,
                }),
            ),
            "/_gonk/cache/clear" => {
                self.cache_manager.clear_all();
                GatewayResponse::json(StatusCode::OK, &json!({"status": "cache cleared"}))
            }
            "/_gonk/cache/stats" => {
                let stats = self.cache_manager.stats();
                GatewayResponse::json(
                    StatusCode::OK,
                    &serde_json::to_value(stats).unwrap_or_else(|_| json!({})),
                )
            }
            _ => GatewayResponse::error(StatusCode::NOT_FOUND, "route not found"),
        }
    }

    fn serve_metrics(&self, method: &Method) -> GatewayResponse {
        if method != Method::GET {
            return GatewayResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        GatewayResponse::new(
            StatusCode::OK,
            headers,
            bytes::Bytes::from(metrics::render()),
        )
    }

    /// Stop per-route background tasks. Dropping the dispatcher has the
    /// same effect once in-flight requests finish; this just makes
    /// shutdown prompt.
    pub fn shutdown(&self) {
        for (_, lb) in &self.balancers {
            lb.stop();
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(path: &str) -> PathPattern {
        PathPattern::parse(path)
    }

    #[test]
    fn exact_patterns_match_trailing_slash_variant() {
        let p = pattern("/a/b");
        assert!(p.matches("/a/b"));
        assert!(p.matches("/a/b/"));
        assert!(!p.matches("/a/b/c"));
        assert!(!p.matches("/a"));
    }

    #[test]
    fn wildcard_patterns_are_prefixes() {
        let p = pattern("/api/*");
        assert_eq!(p.kind, PatternKind::Prefix);
        assert!(p.matches("/api/widgets"));
        assert!(p.matches("/api/"));
        assert!(!p.matches("/api"));
        assert!(!p.matches("/apix"));
    }

    #[test]
    fn trailing_slash_patterns_are_prefixes() {
        let p = pattern("/svc/");
        assert_eq!(p.kind, PatternKind::Prefix);
        assert!(p.matches("/svc/x"));
        assert!(!p.matches("/svc"));
    }

    #[test]
    fn exact_sorts_before_any_prefix_and_longer_prefix_first() {
        let exact = pattern("/a/b").specificity();
        let long = pattern("/a/b/*").specificity();
        let short = pattern("/a/*").specificity();

        assert!(exact < long);
        assert!(long < short);
    }
}
