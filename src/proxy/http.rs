use std::sync::Arc;

use hyper::header::{HeaderValue, HOST};
use hyper::{HeaderMap, StatusCode};
use tracing::warn;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::lb::{LoadBalancer, Outcome};
use crate::proxy::{rewrite_path, RouteTarget};

/// Headers that must not cross the proxy boundary in either direction.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// HTTP/1.1 and HTTP/2 reverse proxy.
pub struct HttpForwarder {
    target: Arc<RouteTarget>,
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(target: Arc<RouteTarget>) -> Result<Self, GatewayError> {
        let timeout = target.timeout.clone().unwrap_or_default();
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.connect)
            .timeout(timeout.read)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::InternalError(format!("http client: {e}")))?;

        Ok(Self { target, client })
    }

    pub async fn forward(
        &self,
        request: GatewayRequest,
        lb: &Arc<LoadBalancer>,
    ) -> Result<GatewayResponse, GatewayError> {
        let lease = lb.select(request.client_ip());

        let mut url = lease.url().clone();
        url.set_path(&rewrite_path(
            &self.target.path,
            self.target.strip_path,
            request.uri.path(),
        ));
        url.set_query(request.uri.query());

        let headers = self.outbound_headers(&request);

        let outbound = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await;

        match outbound {
            Ok(upstream) => {
                let status = upstream.status();
                let mut headers = filter_hop_by_hop(upstream.headers());
                headers.insert("X-Proxy", HeaderValue::from_static("gonk"));

                let body = match upstream.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(route = %self.target.name, error = %e, "upstream body read failed");
                        lease.release(Outcome::Failure);
                        return Ok(self.bad_gateway());
                    }
                };

                lease.release(if status.as_u16() >= 500 {
                    Outcome::Failure
                } else {
                    Outcome::Success
                });

                Ok(GatewayResponse::new(status, headers, body))
            }
            Err(e) => {
                warn!(route = %self.target.name, error = %e, "proxy error");
                lease.release(Outcome::Failure);
                Ok(self.bad_gateway())
            }
        }
    }

    fn outbound_headers(&self, request: &GatewayRequest) -> HeaderMap {
        let mut headers = filter_hop_by_hop(&request.headers);

        let original_host = request
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                request
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        // reqwest sets Host from the upstream URL.
        headers.remove(HOST);

        for (name, value) in &self.target.static_headers {
            headers.insert(name.clone(), value.clone());
        }

        let client_ip = request.client_ip().to_string();
        if let Ok(value) = HeaderValue::from_str(&client_ip) {
            headers.insert("X-Real-IP", value);
        }

        let forwarded_for = match request.headers.get("x-forwarded-for") {
            Some(prior) => match prior.to_str() {
                Ok(prior) => format!("{prior}, {client_ip}"),
                Err(_) => client_ip.clone(),
            },
            None => client_ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("X-Forwarded-For", value);
        }

        headers.insert(
            "X-Forwarded-Proto",
            HeaderValue::from_static(if request.tls { "https" } else { "http" }),
        );

        if let Some(host) = original_host {
            headers.insert("X-Forwarded-Host", host);
        }

        headers
    }

    fn bad_gateway(&self) -> GatewayResponse {
        let body = format!(
            "{{\"error\":\"upstream unavailable\",\"route\":\"{}\"}}",
            self.target.name
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        GatewayResponse::new(
            StatusCode::BAD_GATEWAY,
            headers,
            bytes::Bytes::from(body),
        )
    }
}

fn filter_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("content-length", "12".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());

        let filtered = filter_hop_by_hop(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn repeated_headers_survive_filtering() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());

        let filtered = filter_hop_by_hop(&headers);
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
    }
}
