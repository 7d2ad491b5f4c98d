use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use tracing::warn;

use crate::config::{TransformConfig, TransformRule};
use crate::core::pipeline::{Middleware, MiddlewareHandler};
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;

/// Header add/remove transforms around the inner call. `${request_id}` and
/// `${remote_addr}` substitute per-request values; adds use insert semantics
/// so re-applying an identical transform is a no-op.
pub struct TransformMiddleware {
    config: TransformConfig,
}

impl TransformMiddleware {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    fn substitute(value: &str, request: &GatewayRequest) -> String {
        value
            .replace("${request_id}", &request.request_id)
            .replace("${remote_addr}", &request.remote_addr.to_string())
    }

    fn apply(headers: &mut HeaderMap, rule: &TransformRule, substituted: &[(String, String)]) {
        for (name, value) in substituted {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid transform header"),
            }
        }

        for name in &rule.remove_headers {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.remove(name);
            }
        }
    }
}

#[async_trait]
impl Middleware for TransformMiddleware {
    async fn handle(
        &self,
        mut request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if let Some(rule) = &self.config.request {
            let substituted: Vec<(String, String)> = rule
                .add_headers
                .iter()
                .map(|(k, v)| (k.clone(), Self::substitute(v, &request)))
                .collect();
            Self::apply(&mut request.headers, rule, &substituted);
        }

        let mut resp = next.handle(request).await?;

        if let Some(rule) = &self.config.response {
            let added: Vec<(String, String)> = rule
                .add_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Self::apply(&mut resp.headers, rule, &added);
        }

        Ok(resp)
    }

    fn name(&self) -> &str {
        "transform"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use hyper::{Method, StatusCode, Uri};

    use super::*;

    struct EchoHeaders;

    #[async_trait]
    impl MiddlewareHandler for EchoHeaders {
        async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
            // Reflect request headers back as the response headers.
            Ok(GatewayResponse::new(
                StatusCode::OK,
                request.headers.clone(),
                Bytes::new(),
            ))
        }
    }

    fn rule(add: &[(&str, &str)], remove: &[&str]) -> TransformRule {
        TransformRule {
            add_headers: add
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            remove_headers: remove.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn request() -> GatewayRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-internal-secret", "s".parse().unwrap());
        GatewayRequest::new(
            Method::GET,
            Uri::from_static("/x"),
            headers,
            Bytes::new(),
            "192.168.1.9:4444".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn request_headers_added_and_removed() {
        let mw = TransformMiddleware::new(TransformConfig {
            request: Some(rule(
                &[("X-Gateway", "gonk"), ("X-Trace", "${request_id}")],
                &["x-internal-secret"],
            )),
            response: None,
        });

        let req = request();
        let id = req.request_id.clone();
        let resp = mw.handle(req, Arc::new(EchoHeaders)).await.unwrap();

        assert_eq!(resp.headers.get("X-Gateway").unwrap(), "gonk");
        assert_eq!(resp.headers.get("X-Trace").unwrap(), id.as_str());
        assert!(resp.headers.get("x-internal-secret").is_none());
    }

    #[tokio::test]
    async fn remote_addr_substitution() {
        let mw = TransformMiddleware::new(TransformConfig {
            request: Some(rule(&[("X-Origin", "${remote_addr}")], &[])),
            response: None,
        });

        let resp = mw.handle(request(), Arc::new(EchoHeaders)).await.unwrap();
        assert_eq!(resp.headers.get("X-Origin").unwrap(), "192.168.1.9:4444");
    }

    #[tokio::test]
    async fn response_headers_transformed() {
        let mw = TransformMiddleware::new(TransformConfig {
            request: None,
            response: Some(rule(&[("X-Frame-Options", "DENY")], &["x-internal-secret"])),
        });

        let resp = mw.handle(request(), Arc::new(EchoHeaders)).await.unwrap();
        assert_eq!(resp.headers.get("X-Frame-Options").unwrap(), "DENY");
        assert!(resp.headers.get("x-internal-secret").is_none());
    }

    #[tokio::test]
    async fn transform_is_idempotent() {
        let config = TransformConfig {
            request: Some(rule(&[("X-Gateway", "gonk")], &["x-internal-secret"])),
            response: None,
        };
        let mw = TransformMiddleware::new(config);

        let once = mw.handle(request(), Arc::new(EchoHeaders)).await.unwrap();

        // Run the already-transformed header set through again.
        let mut again = request();
        again.headers = once.headers.clone();
        let twice = mw.handle(again, Arc::new(EchoHeaders)).await.unwrap();

        assert_eq!(once.headers, twice.headers);
    }
}
