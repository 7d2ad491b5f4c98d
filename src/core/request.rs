use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper::{Body, HeaderMap, Method, Uri};

/// Identity extracted from a verified client certificate.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    /// Subject CommonName
    pub common_name: String,

    /// Subject Organization values
    pub organizations: Vec<String>,
}

/// A request travelling through a route's middleware pipeline.
///
/// Bodies are buffered up front; the two exceptions are WebSocket upgrades
/// (which carry the connection's `OnUpgrade` handle) and streaming gRPC
/// calls (which keep the raw body for frame-by-frame pumping). Both slots
/// are taken exactly once by the matching forwarder.
#[derive(Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: hyper::Version,
    pub headers: HeaderMap,
    pub body: Bytes,

    /// Peer socket address of the client connection
    pub remote_addr: SocketAddr,

    /// Whether the client connection was TLS-terminated
    pub tls: bool,

    /// Identity from the client certificate, when mTLS produced one
    pub client_cert: Option<ClientIdentity>,

    /// Request ID, either propagated from X-Request-ID or generated
    pub request_id: String,

    /// Set by the auth middleware once the request is authenticated
    pub auth: Option<crate::middleware::auth::AuthContext>,

    upgrade: Option<OnUpgrade>,
    raw_body: Option<Body>,
}

impl GatewayRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
    ) -> Self {
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            method,
            uri,
            version: hyper::Version::HTTP_11,
            headers,
            body,
            remote_addr,
            tls: false,
            client_cert: None,
            request_id,
            auth: None,
            upgrade: None,
            raw_body: None,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_version(mut self, version: hyper::Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_client_cert(mut self, cert: Option<ClientIdentity>) -> Self {
        self.client_cert = cert;
        self
    }

    pub fn with_upgrade(mut self, upgrade: Option<OnUpgrade>) -> Self {
        self.upgrade = upgrade;
        self
    }

    pub fn with_raw_body(mut self, body: Body) -> Self {
        self.raw_body = Some(body);
        self
    }

    /// Get a header value as a string
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn client_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// True when the request carries a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let connection = self
            .header("connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
        upgrade && connection
    }

    /// Take the connection upgrade handle; only the WebSocket forwarder does.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }

    /// Take the unbuffered request body; only the gRPC forwarder does.
    pub fn take_raw_body(&mut self) -> Option<Body> {
        self.raw_body.take()
    }

    pub fn has_raw_body(&self) -> bool {
        self.raw_body.is_some()
    }
}
