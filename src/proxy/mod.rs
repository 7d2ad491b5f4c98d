pub mod grpc;
pub mod http;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use tracing::warn;

use crate::config::{Protocol, Route, TimeoutConfig};
use crate::core::pipeline::MiddlewareHandler;
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::lb::LoadBalancer;

/// Route fields the forwarders need, resolved once at materialization.
pub struct RouteTarget {
    pub name: String,
    pub path: String,
    pub strip_path: bool,
    pub protocol: Protocol,
    pub static_headers: Vec<(HeaderName, HeaderValue)>,
    pub timeout: Option<TimeoutConfig>,
}

impl RouteTarget {
    fn from_route(route: &Route) -> Self {
        let static_headers = route
            .headers
            .iter()
            .filter_map(|(k, v)| {
                match (
                    HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(v),
                ) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        warn!(route = %route.name, header = %k, "skipping invalid static header");
                        None
                    }
                }
            })
            .collect();

        Self {
            name: route.name.clone(),
            path: route.path.clone(),
            strip_path: route.strip_path,
            protocol: route.protocol,
            static_headers,
            timeout: route.timeout.clone(),
        }
    }
}

/// Innermost pipeline stage: selects an upstream and forwards over the
/// route's wire protocol.
pub struct Forwarder {
    target: Arc<RouteTarget>,
    lb: Arc<LoadBalancer>,
    http: http::HttpForwarder,
    grpc: Option<grpc::GrpcForwarder>,
}

impl Forwarder {
    pub fn new(route: &Route, lb: Arc<LoadBalancer>) -> Result<Self, GatewayError> {
        let target = Arc::new(RouteTarget::from_route(route));

        let grpc = if route.protocol == Protocol::Grpc {
            Some(grpc::GrpcForwarder::new(route, Arc::clone(&target))?)
        } else {
            None
        };

        let http = http::HttpForwarder::new(Arc::clone(&target))?;

        Ok(Self {
            target,
            lb,
            http,
            grpc,
        })
    }
}

#[async_trait]
impl MiddlewareHandler for Forwarder {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        if self.target.protocol.is_websocket() && request.is_websocket_upgrade() {
            return websocket::forward(request, &self.target, &self.lb).await;
        }

        if let Some(grpc) = &self.grpc {
            return grpc.forward(request, &self.lb).await;
        }

        self.http.forward(request, &self.lb).await
    }
}

/// Remove the matched route prefix (everything before `*` or the trailing
/// slash) from the forwarded path; the result always begins with `/`.
pub fn rewrite_path(route_path: &str, strip_path: bool, path: &str) -> String {
    if !strip_path {
        return path.to_string();
    }

    let prefix = route_path
        .strip_suffix("/*")
        .or_else(|| route_path.strip_suffix('/'))
        .unwrap_or(route_path);

    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_wildcard_prefix() {
        assert_eq!(rewrite_path("/api/*", true, "/api/widgets"), "/widgets");
        assert_eq!(rewrite_path("/api/*", true, "/api"), "/");
        assert_eq!(rewrite_path("/api/*", true, "/api/"), "/");
    }

    #[test]
    fn strip_trailing_slash_prefix() {
        assert_eq!(rewrite_path("/svc/", true, "/svc/a/b"), "/a/b");
    }

    #[test]
    fn strip_exact_path() {
        assert_eq!(rewrite_path("/status", true, "/status"), "/");
    }

    #[test]
    fn no_strip_passes_through() {
        assert_eq!(rewrite_path("/api/*", false, "/api/widgets"), "/api/widgets");
    }
}
