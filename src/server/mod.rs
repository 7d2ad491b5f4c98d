pub mod listener;
pub mod tls;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, ORIGIN, TE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Body, HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{CorsConfig, GatewayConfig};
use crate::core::dispatcher::{Dispatcher, SharedState};
use crate::core::request::{ClientIdentity, GatewayRequest};
use crate::core::response::{EdgeBody, GatewayResponse};
use crate::error::GatewayError;
use crate::middleware::{logging, metrics};

/// Window for draining in-flight requests at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type DispatcherHandle = Arc<RwLock<Arc<Dispatcher>>>;

#[derive(Clone)]
struct ConnShared {
    dispatcher: DispatcherHandle,
    cors: Option<CorsConfig>,
}

/// The gateway server: owns the listener, the active dispatcher generation,
/// and the managers that survive reloads.
pub struct Server {
    config: GatewayConfig,
    shared: Arc<SharedState>,
    dispatcher: DispatcherHandle,
}

impl Server {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.metrics.enabled {
            metrics::install();
        }

        let shared = Arc::new(SharedState::new());
        Arc::clone(&shared.rate_limiter).spawn_sweeper();

        let dispatcher = Dispatcher::build(&config, &shared)?;

        Ok(Self {
            config,
            shared,
            dispatcher: Arc::new(RwLock::new(Arc::new(dispatcher))),
        })
    }

    /// Build a new dispatcher off-path and swap it in. In-flight requests
    /// finish against the generation they started with; its load balancers
    /// wind down when the last reference drops.
    pub async fn reload(&self, new_config: GatewayConfig) {
        match Dispatcher::build(&new_config, &self.shared) {
            Ok(dispatcher) => {
                let routes = dispatcher.route_count();
                *self.dispatcher.write().await = Arc::new(dispatcher);
                info!(routes, "configuration reloaded");
            }
            Err(e) => error!(error = %e, "reload failed, keeping previous configuration"),
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), GatewayError> {
        let addr = parse_listen(&self.config.server.listen)?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an existing listener until `shutdown`
    /// resolves, then drain within the grace window.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), GatewayError> {
        let tls_acceptor = match &self.config.server.tls {
            Some(cfg) if cfg.enabled => {
                info!("TLS enabled");
                Some(tls::build_acceptor(cfg, self.config.server.http2)?)
            }
            _ => None,
        };

        let local_addr = listener.local_addr()?;
        let routes = self.dispatcher.read().await.route_count();
        info!(
            addr = %local_addr,
            http2 = self.config.server.http2,
            routes,
            "gonk listening"
        );

        let max_connections = match self.config.server.max_connections {
            0 => 1024,
            n => n,
        };
        let limiter = Arc::new(Semaphore::new(max_connections));
        let active = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let conn_shared = ConnShared {
            dispatcher: Arc::clone(&self.dispatcher),
            cors: self.config.server.cors.clone(),
        };
        let http2 = self.config.server.http2;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = accept_next(&listener, &limiter) => {
                    let (permit, stream, peer) = match accepted {
                        Ok(ok) => ok,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let acceptor = tls_acceptor.clone();
                    let shared = conn_shared.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    let active = Arc::clone(&active);

                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) =
                            handle_connection(stream, peer, acceptor, http2, shared, shutdown_rx)
                                .await
                        {
                            debug!(peer = %peer, error = %e, "connection ended with error");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        info!("shutdown signal received, draining connections");
        let _ = shutdown_tx.send(true);
        self.dispatcher.read().await.shutdown();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "shutdown grace expired with connections still open");
        } else {
            info!("all connections drained");
        }

        Ok(())
    }
}

async fn accept_next(
    listener: &TcpListener,
    limiter: &Arc<Semaphore>,
) -> std::io::Result<(
    tokio::sync::OwnedSemaphorePermit,
    tokio::net::TcpStream,
    SocketAddr,
)> {
    let permit = Arc::clone(limiter)
        .acquire_owned()
        .await
        .expect("connection semaphore closed");
    let (stream, peer) = listener.accept().await?;
    Ok((permit, stream, peer))
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    http2: bool,
    shared: ConnShared,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            let (identity, is_h2) = {
                let (_, session) = tls_stream.get_ref();
                (
                    session
                        .peer_certificates()
                        .and_then(tls::client_identity),
                    session.alpn_protocol() == Some(&b"h2"[..]),
                )
            };
            serve_connection(tls_stream, peer, identity, true, is_h2, shared, shutdown_rx).await
        }
        None if http2 => {
            let (is_h2, stream) = listener::sniff_h2_preface(stream).await?;
            serve_connection(stream, peer, None, false, is_h2, shared, shutdown_rx).await
        }
        None => serve_connection(stream, peer, None, false, false, shared, shutdown_rx).await,
    }
}

async fn serve_connection<IO>(
    io: IO,
    peer: SocketAddr,
    identity: Option<ClientIdentity>,
    tls_on: bool,
    h2: bool,
    shared: ConnShared,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let shared = shared.clone();
        let identity = identity.clone();
        async move {
            Ok::<_, Infallible>(
                handle_request(req, shared, peer, tls_on, identity).await,
            )
        }
    });

    let mut http = Http::new();
    if h2 {
        http.http2_only(true);
    } else {
        http.http1_only(true);
    }

    let conn = http.serve_connection(io, service).with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result?,
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await?;
        }
    }

    Ok(())
}

/// One request, one terminal response: buffer (or hand off) the body,
/// dispatch through the active pipeline generation, catch panics at this
/// outermost layer, stamp the request id, and write the access log line.
async fn handle_request(
    req: hyper::Request<Body>,
    shared: ConnShared,
    peer: SocketAddr,
    tls_on: bool,
    identity: Option<ClientIdentity>,
) -> hyper::Response<EdgeBody> {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    if let Some(cors) = shared.cors.as_ref().filter(|c| c.enabled) {
        if method == Method::OPTIONS && parts.headers.contains_key(ORIGIN) {
            return cors_preflight(cors, &parts.headers).into_hyper();
        }
    }

    let on_upgrade = parts.extensions.remove::<OnUpgrade>();

    // Streaming gRPC bodies are pumped frame by frame, never buffered.
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let te_trailers = parts
        .headers
        .get(TE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("trailers"));
    let grpc_streaming = content_type.starts_with("application/grpc")
        && (te_trailers || !parts.headers.contains_key(CONTENT_LENGTH));

    let (buffered, raw_body) = if grpc_streaming {
        (Bytes::new(), Some(body))
    } else {
        match hyper::body::to_bytes(body).await {
            Ok(bytes) => (bytes, None),
            Err(e) => {
                debug!(peer = %peer, error = %e, "failed to read request body");
                return GatewayResponse::error(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                )
                .into_hyper();
            }
        }
    };

    let mut request = GatewayRequest::new(method.clone(), parts.uri, parts.headers, buffered, peer)
        .with_version(parts.version)
        .with_tls(tls_on)
        .with_client_cert(identity)
        .with_upgrade(on_upgrade);
    if let Some(raw) = raw_body {
        request = request.with_raw_body(raw);
    }

    let request_id = request.request_id.clone();
    let origin = request.header("origin");

    let dispatcher = { Arc::clone(&*shared.dispatcher.read().await) };

    let mut response = match std::panic::AssertUnwindSafe(dispatcher.dispatch(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(_) => {
            error!(request_id = %request_id, "panic while handling request");
            GatewayResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers.insert("X-Request-ID", value);
    }

    if let (Some(cors), Some(origin)) = (shared.cors.as_ref().filter(|c| c.enabled), origin) {
        if let Some(allow) = allowed_origin(cors, &origin) {
            response
                .headers
                .insert("Access-Control-Allow-Origin", allow);
        }
    }

    let size = response.body_bytes().map(Bytes::len).unwrap_or(0);
    logging::log_request(peer, &method, &path, response.status, size, started.elapsed());

    response.into_hyper()
}

fn cors_preflight(cors: &CorsConfig, headers: &HeaderMap) -> GatewayResponse {
    let mut response = GatewayResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), Bytes::new());

    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Some(allow) = allowed_origin(cors, origin) {
        response
            .headers
            .insert("Access-Control-Allow-Origin", allow);
    }

    if !cors.allowed_methods.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cors.allowed_methods.join(", ")) {
            response
                .headers
                .insert("Access-Control-Allow-Methods", value);
        }
    }
    if !cors.allowed_headers.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cors.allowed_headers.join(", ")) {
            response
                .headers
                .insert("Access-Control-Allow-Headers", value);
        }
    }
    if cors.max_age > 0 {
        if let Ok(value) = HeaderValue::from_str(&cors.max_age.to_string()) {
            response.headers.insert("Access-Control-Max-Age", value);
        }
    }

    response
}

fn allowed_origin(cors: &CorsConfig, origin: &str) -> Option<HeaderValue> {
    if cors.allowed_origins.iter().any(|o| o == "*") {
        return Some(HeaderValue::from_static("*"));
    }
    if cors.allowed_origins.iter().any(|o| o == origin) {
        return HeaderValue::from_str(origin).ok();
    }
    None
}

/// ":8080" listens on all interfaces, Go style.
fn parse_listen(listen: &str) -> Result<SocketAddr, GatewayError> {
    let normalized = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };

    normalized
        .parse()
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid listen address {listen}: {e}")))
}
