use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hyper::header::HeaderValue;
use hyper::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::Protocol;
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::lb::{LoadBalancer, Outcome};
use crate::proxy::{rewrite_path, RouteTarget};

/// Tunnel a WebSocket upgrade: dial the upstream first, then complete the
/// client handshake and pump frames verbatim in both directions. Either
/// side closing or erroring terminates both pumps.
pub async fn forward(
    mut request: GatewayRequest,
    target: &Arc<RouteTarget>,
    lb: &Arc<LoadBalancer>,
) -> Result<GatewayResponse, GatewayError> {
    let Some(client_key) = request.header("sec-websocket-key") else {
        return Ok(GatewayResponse::error(
            StatusCode::BAD_REQUEST,
            "missing Sec-WebSocket-Key",
        ));
    };

    let Some(on_upgrade) = request.take_upgrade() else {
        return Ok(GatewayResponse::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection does not support upgrade",
        ));
    };

    let lease = lb.select(request.client_ip());
    let upstream_url = build_upstream_url(&request, target, lease.url());

    let mut upstream_req = match upstream_url.as_str().into_client_request() {
        Ok(req) => req,
        Err(e) => {
            lease.release(Outcome::Failure);
            warn!(route = %target.name, error = %e, "invalid upstream websocket url");
            return Ok(GatewayResponse::error(
                StatusCode::BAD_GATEWAY,
                "failed to connect to upstream",
            ));
        }
    };

    // Subprotocol and extension offers pass through; the handshake headers
    // themselves are produced fresh for the upstream leg.
    for name in ["sec-websocket-protocol", "sec-websocket-extensions"] {
        for value in request.headers.get_all(name) {
            upstream_req.headers_mut().append(
                hyper::header::HeaderName::from_static(name),
                value.clone(),
            );
        }
    }
    for (name, value) in &target.static_headers {
        upstream_req.headers_mut().insert(name.clone(), value.clone());
    }

    debug!(route = %target.name, upstream = %upstream_url, "connecting to upstream websocket");

    let (upstream_ws, upstream_resp) = match connect_async(upstream_req).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(route = %target.name, error = %e, "websocket upstream dial error");
            lease.release(Outcome::Failure);
            return Ok(GatewayResponse::error(
                StatusCode::BAD_GATEWAY,
                "failed to connect to upstream",
            ));
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(client_key.as_bytes())) {
        headers.insert("Sec-WebSocket-Accept", accept);
    }
    if let Some(protocol) = upstream_resp.headers().get("sec-websocket-protocol") {
        headers.insert("Sec-WebSocket-Protocol", protocol.clone());
    }

    let route = target.name.clone();
    let peer = request.remote_addr;
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let client_ws =
                    WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                info!(route = %route, peer = %peer, "websocket tunnel established");
                pump(client_ws, upstream_ws).await;
                info!(route = %route, peer = %peer, "websocket tunnel closed");
                lease.release(Outcome::Success);
            }
            Err(e) => {
                warn!(route = %route, error = %e, "client upgrade failed");
                lease.release(Outcome::Failure);
            }
        }
    });

    Ok(GatewayResponse::new(
        StatusCode::SWITCHING_PROTOCOLS,
        headers,
        Bytes::new(),
    ))
}

fn build_upstream_url(
    request: &GatewayRequest,
    target: &RouteTarget,
    upstream: &url::Url,
) -> String {
    let scheme = match target.protocol {
        Protocol::Wss => "wss",
        _ => "ws",
    };

    let host = upstream.host_str().unwrap_or("localhost");
    let authority = match upstream.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path = rewrite_path(&target.path, target.strip_path, request.uri.path());

    match request.uri.query() {
        Some(query) => format!("{scheme}://{authority}{path}?{query}"),
        None => format!("{scheme}://{authority}{path}"),
    }
}

/// Forward frames until either side closes or errors. Normal closes are
/// forwarded and end the tunnel without error logging.
async fn pump<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(error = %e, "client read ended");
                    break;
                }
            };
            let closing = msg.is_close();
            if upstream_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(error = %e, "upstream read ended");
                    break;
                }
            };
            let closing = msg.is_close();
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

#[cfg(test)]
mod tests {
    use hyper::{HeaderMap, Method, Uri};

    use super::*;

    fn target(protocol: Protocol) -> RouteTarget {
        RouteTarget {
            name: "ws-route".into(),
            path: "/ws/*".into(),
            strip_path: true,
            protocol,
            static_headers: vec![],
            timeout: None,
        }
    }

    #[test]
    fn upstream_url_rewrites_scheme_and_path() {
        let req = GatewayRequest::new(
            Method::GET,
            Uri::from_static("/ws/echo?room=1"),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:5000".parse().unwrap(),
        );
        let upstream = url::Url::parse("http://backend:9001").unwrap();

        let url = build_upstream_url(&req, &target(Protocol::Ws), &upstream);
        assert_eq!(url, "ws://backend:9001/echo?room=1");

        let url = build_upstream_url(&req, &target(Protocol::Wss), &upstream);
        assert_eq!(url, "wss://backend:9001/echo?room=1");
    }
}
