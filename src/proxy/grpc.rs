use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use hyper::header::HeaderValue;
use hyper::http::uri::PathAndQuery;
use hyper::{Body, HeaderMap, StatusCode, Version};
use tokio::sync::mpsc;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};
use url::Url;

use crate::config::Route;
use crate::core::request::GatewayRequest;
use crate::core::response::{BoxError, GatewayResponse, ResponseBody};
use crate::error::{GatewayError, ProxyError};
use crate::lb::{Lease, LoadBalancer, Outcome};
use crate::proxy::RouteTarget;

/// Maximum gRPC message size in either direction.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// gRPC pass-through forwarder. One persistent HTTP/2 channel per upstream
/// with keepalive; frames cross without their payloads being decoded.
pub struct GrpcForwarder {
    target: Arc<RouteTarget>,
    channels: HashMap<String, Channel>,
}

impl GrpcForwarder {
    pub fn new(route: &Route, target: Arc<RouteTarget>) -> Result<Self, GatewayError> {
        let connect_timeout = route
            .timeout
            .as_ref()
            .map(|t| t.connect)
            .unwrap_or(Duration::from_secs(10));

        let mut channels = HashMap::new();
        for upstream in &route.upstreams {
            let url = Url::parse(&upstream.url).map_err(|e| {
                GatewayError::InternalError(format!("invalid grpc upstream url: {e}"))
            })?;

            let endpoint = Endpoint::from_shared(upstream.url.clone())
                .map_err(|e| {
                    GatewayError::InternalError(format!("invalid grpc endpoint: {e}"))
                })?
                .connect_timeout(connect_timeout)
                .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
                .keep_alive_timeout(KEEPALIVE_TIMEOUT)
                .keep_alive_while_idle(true);

            channels.insert(url.to_string(), endpoint.connect_lazy());
        }

        Ok(Self { target, channels })
    }

    pub async fn forward(
        &self,
        mut request: GatewayRequest,
        lb: &Arc<LoadBalancer>,
    ) -> Result<GatewayResponse, GatewayError> {
        if request.version != Version::HTTP_2 {
            return Ok(GatewayResponse::error(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "gRPC requires HTTP/2",
            ));
        }

        let content_type = request.header("content-type").unwrap_or_default();
        if !content_type.starts_with("application/grpc") {
            return Ok(GatewayResponse::error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "invalid gRPC request content-type",
            ));
        }

        let path = request.uri.path().to_string();
        if path.split('/').count() < 3 {
            return Ok(GatewayResponse::error(
                StatusCode::BAD_REQUEST,
                "invalid gRPC path",
            ));
        }
        let Ok(method_path) = PathAndQuery::from_maybe_shared(path) else {
            return Ok(GatewayResponse::error(
                StatusCode::BAD_REQUEST,
                "invalid gRPC path",
            ));
        };

        let lease = lb.select(request.client_ip());
        let Some(channel) = self.channels.get(&lease.url().to_string()) else {
            lease.release(Outcome::Failure);
            return Ok(grpc_error_response(&Status::unavailable(
                "upstream unavailable",
            )));
        };

        let mut grpc = Grpc::new(channel.clone());
        if let Err(e) = grpc.ready().await {
            debug!(route = %self.target.name, error = %e, "grpc channel not ready");
            lease.release(Outcome::Failure);
            return Ok(grpc_error_response(&Status::unavailable(
                "upstream unavailable",
            )));
        }

        let metadata = MetadataMap::from_headers(metadata_headers(&request.headers));

        if request.has_raw_body() {
            self.forward_streaming(&mut request, grpc, method_path, metadata, lease)
                .await
        } else {
            self.forward_unary(&request, grpc, method_path, metadata, lease)
                .await
        }
    }

    async fn forward_unary(
        &self,
        request: &GatewayRequest,
        mut grpc: Grpc<Channel>,
        path: PathAndQuery,
        metadata: MetadataMap,
        lease: Lease,
    ) -> Result<GatewayResponse, GatewayError> {
        let payload = match decode_single_frame(&request.body) {
            Ok(payload) => payload,
            Err(e) => {
                lease.release(Outcome::Success);
                return Ok(grpc_error_response(&Status::invalid_argument(
                    e.to_string(),
                )));
            }
        };

        let mut outbound = tonic::Request::new(payload);
        *outbound.metadata_mut() = metadata;

        let call = grpc.unary(outbound, path, BytesCodec);
        let result = match self.target.timeout.as_ref() {
            Some(t) => match tokio::time::timeout(t.read, call).await {
                Ok(result) => result,
                Err(_) => {
                    lease.release(Outcome::Failure);
                    return Ok(grpc_error_response(&Status::deadline_exceeded(
                        "upstream deadline exceeded",
                    )));
                }
            },
            None => call.await,
        };

        match result {
            Ok(response) => {
                let (meta, payload, _) = response.into_parts();

                let mut headers = meta.into_headers();
                headers.insert(
                    hyper::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/grpc"),
                );
                headers.insert("grpc-status", HeaderValue::from_static("0"));

                lease.release(Outcome::Success);
                Ok(GatewayResponse::new(
                    StatusCode::OK,
                    headers,
                    encode_frame(&payload),
                ))
            }
            Err(status) => {
                lease.release(if status.code() == Code::Unavailable {
                    Outcome::Failure
                } else {
                    Outcome::Success
                });
                Ok(grpc_error_response(&status))
            }
        }
    }

    async fn forward_streaming(
        &self,
        request: &mut GatewayRequest,
        mut grpc: Grpc<Channel>,
        path: PathAndQuery,
        metadata: MetadataMap,
        lease: Lease,
    ) -> Result<GatewayResponse, GatewayError> {
        let raw_body = request
            .take_raw_body()
            .expect("streaming dispatch requires a raw body");

        // Client frames feed the outbound message stream.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(read_frames(raw_body, frame_tx));
        let outbound =
            futures_util::stream::poll_fn(move |cx| frame_rx.poll_recv(cx));

        let mut outbound = tonic::Request::new(outbound);
        *outbound.metadata_mut() = metadata;

        match grpc.streaming(outbound, path, BytesCodec).await {
            Ok(response) => {
                let (meta, mut inbound, _) = response.into_parts();

                let mut headers = meta.into_headers();
                headers.insert(
                    hyper::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/grpc"),
                );

                let (event_tx, event_rx) = mpsc::channel::<GrpcEvent>(16);
                tokio::spawn(async move {
                    loop {
                        match inbound.next().await {
                            Some(Ok(payload)) => {
                                if event_tx
                                    .send(GrpcEvent::Data(encode_frame(&payload)))
                                    .await
                                    .is_err()
                                {
                                    lease.release(Outcome::Success);
                                    return;
                                }
                            }
                            Some(Err(status)) => {
                                let _ = event_tx
                                    .send(GrpcEvent::Trailers(status_trailers(&status)))
                                    .await;
                                lease.release(if status.code() == Code::Unavailable {
                                    Outcome::Failure
                                } else {
                                    Outcome::Success
                                });
                                return;
                            }
                            None => {
                                let mut trailers = match inbound.trailers().await {
                                    Ok(Some(meta)) => meta.into_headers(),
                                    _ => HeaderMap::new(),
                                };
                                trailers
                                    .entry("grpc-status")
                                    .or_insert(HeaderValue::from_static("0"));
                                let _ =
                                    event_tx.send(GrpcEvent::Trailers(trailers)).await;
                                lease.release(Outcome::Success);
                                return;
                            }
                        }
                    }
                });

                let body = GrpcStreamBody::new(event_rx);
                Ok(GatewayResponse {
                    status: StatusCode::OK,
                    headers,
                    body: ResponseBody::Stream(http_body::Body::boxed_unsync(body)),
                })
            }
            Err(status) => {
                lease.release(if status.code() == Code::Unavailable {
                    Outcome::Failure
                } else {
                    Outcome::Success
                });
                Ok(grpc_error_response(&status))
            }
        }
    }
}

/// Read length-prefixed frames off the client body and emit their payloads.
async fn read_frames(mut body: Body, tx: mpsc::Sender<Bytes>) {
    let mut buf = BytesMut::new();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(e) => {
                debug!(error = %e, "grpc request body ended");
                return;
            }
        }

        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => {
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "bad grpc frame from client");
                    return;
                }
            }
        }
    }
}

/// Wire frame: 1 byte compressed flag, 4 bytes big-endian length, payload.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split one complete frame off the front of `buf`, if present.
/// Compressed frames are rejected; so are frames over the size cap.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProxyError> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let flag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if flag == 1 {
        return Err(ProxyError::GrpcBadFrame(
            "compressed messages not supported".into(),
        ));
    }
    if flag != 0 {
        return Err(ProxyError::GrpcBadFrame(format!(
            "invalid compression flag {flag}"
        )));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ProxyError::GrpcBadFrame(format!(
            "message too large: {len} bytes"
        )));
    }

    if buf.len() < 5 + len {
        return Ok(None);
    }

    buf.advance(5);
    Ok(Some(buf.split_to(len).freeze()))
}

/// A unary request body is exactly one frame.
pub fn decode_single_frame(body: &[u8]) -> Result<Bytes, ProxyError> {
    let mut buf = BytesMut::from(body);
    match try_decode_frame(&mut buf)? {
        Some(payload) if buf.is_empty() => Ok(payload),
        Some(_) => Err(ProxyError::GrpcBadFrame(
            "unexpected bytes after message frame".into(),
        )),
        None => Err(ProxyError::GrpcBadFrame("incomplete message frame".into())),
    }
}

/// Forward request headers that carry gRPC metadata: `grpc-*`, `x-*`, and
/// `authorization`.
fn metadata_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        if name_str.starts_with("grpc-")
            || name_str.starts_with("x-")
            || name_str == "authorization"
        {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// gRPC status always travels in headers with HTTP 200.
fn grpc_error_response(status: &Status) -> GatewayResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert(
        "grpc-status",
        HeaderValue::from_str(&(status.code() as i32).to_string())
            .expect("numeric header value"),
    );
    if let Ok(message) = HeaderValue::from_str(status.message()) {
        headers.insert("grpc-message", message);
    }

    GatewayResponse::new(StatusCode::OK, headers, Bytes::new())
}

fn status_trailers(status: &Status) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert(
        "grpc-status",
        HeaderValue::from_str(&(status.code() as i32).to_string())
            .expect("numeric header value"),
    );
    if let Ok(message) = HeaderValue::from_str(status.message()) {
        trailers.insert("grpc-message", message);
    }
    trailers
}

/// Identity codec: messages are opaque byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
pub struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, buf: &mut EncodeBuf<'_>) -> Result<(), Status> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(Status::resource_exhausted("message too large"));
        }
        buf.put(item);
        Ok(())
    }
}

#[derive(Debug)]
pub struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        if buf.remaining() > MAX_MESSAGE_SIZE {
            return Err(Status::resource_exhausted("message too large"));
        }
        Ok(Some(buf.copy_to_bytes(buf.remaining())))
    }
}

enum GrpcEvent {
    Data(Bytes),
    Trailers(HeaderMap),
}

/// Streaming response body: re-framed upstream messages followed by real
/// HTTP/2 trailers.
struct GrpcStreamBody {
    rx: mpsc::Receiver<GrpcEvent>,
    trailers: Option<HeaderMap>,
    data_done: bool,
}

impl GrpcStreamBody {
    fn new(rx: mpsc::Receiver<GrpcEvent>) -> Self {
        Self {
            rx,
            trailers: None,
            data_done: false,
        }
    }
}

impl http_body::Body for GrpcStreamBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, BoxError>>> {
        let this = self.get_mut();
        if this.data_done {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(GrpcEvent::Data(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(GrpcEvent::Trailers(trailers))) => {
                this.trailers = Some(trailers);
                this.data_done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.data_done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, BoxError>> {
        let this = self.get_mut();
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Ok(Some(trailers)));
        }

        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(GrpcEvent::Trailers(trailers))) => {
                    return Poll::Ready(Ok(Some(trailers)))
                }
                Poll::Ready(Some(GrpcEvent::Data(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(Ok(None)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payloads: [&[u8]; 4] = [b"", b"x", b"hello world", &[0xff; 1024]];
        for payload in payloads {
            let framed = encode_frame(payload);
            assert_eq!(framed.len(), 5 + payload.len());
            assert_eq!(framed[0], 0);

            let decoded = decode_single_frame(&framed).unwrap();
            assert_eq!(&decoded[..], payload);
        }
    }

    #[test]
    fn incremental_decode_across_chunks() {
        let framed = encode_frame(b"abcdef");
        let mut buf = BytesMut::new();

        // First half: incomplete.
        buf.extend_from_slice(&framed[..7]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        // Rest arrives, frame completes.
        buf.extend_from_slice(&framed[7..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"one"));
        buf.extend_from_slice(&encode_frame(b"two"));

        assert_eq!(&try_decode_frame(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&try_decode_frame(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn compressed_frames_are_rejected() {
        let mut framed = BytesMut::from(&encode_frame(b"zzz")[..]);
        framed[0] = 1;
        assert!(matches!(
            try_decode_frame(&mut framed),
            Err(ProxyError::GrpcBadFrame(_))
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(ProxyError::GrpcBadFrame(_))
        ));
    }

    #[test]
    fn unary_body_must_be_exactly_one_frame() {
        let mut doubled = BytesMut::new();
        doubled.extend_from_slice(&encode_frame(b"a"));
        doubled.extend_from_slice(&encode_frame(b"b"));
        assert!(decode_single_frame(&doubled).is_err());

        assert!(decode_single_frame(&encode_frame(b"a")[..4]).is_err());
    }

    #[test]
    fn metadata_filter_keeps_grpc_x_and_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-timeout", "5S".parse().unwrap());
        headers.insert("x-trace-id", "t1".parse().unwrap());
        headers.insert("authorization", "Bearer t".parse().unwrap());
        headers.insert("content-type", "application/grpc".parse().unwrap());
        headers.insert("user-agent", "grpc-go/1.0".parse().unwrap());

        let filtered = metadata_headers(&headers);
        assert!(filtered.contains_key("grpc-timeout"));
        assert!(filtered.contains_key("x-trace-id"));
        assert!(filtered.contains_key("authorization"));
        assert!(!filtered.contains_key("content-type"));
        assert!(!filtered.contains_key("user-agent"));
    }

    #[test]
    fn error_response_carries_status_in_headers() {
        let resp = grpc_error_response(&Status::unavailable("upstream unavailable"));
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers.get("grpc-status").unwrap(), "14");
        assert_eq!(
            resp.headers.get("grpc-message").unwrap(),
            "upstream unavailable"
        );
    }
}
