use bytes::Bytes;
use http_body::Body as HttpBody;
use hyper::{Body, HeaderMap, StatusCode};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed streaming body used at the server edge and by streaming forwarders.
pub type EdgeBody = http_body::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// Response body: buffered for everything the policy chain inspects,
/// streaming for gRPC pass-through.
pub enum ResponseBody {
    Full(Bytes),
    Stream(EdgeBody),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            ResponseBody::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// A response travelling back through a route's middleware pipeline.
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Full(body),
        }
    }

    pub fn streaming(status: StatusCode, headers: HeaderMap, body: EdgeBody) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Stream(body),
        }
    }

    /// JSON error body, e.g. `{"error":"rate limit exceeded"}`
    pub fn error(status: StatusCode, message: &str) -> Self {
        let body = format!("{{\"error\":\"{}\"}}", message.replace('"', "\\\""));

        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            "application/json".parse().expect("static header value"),
        );

        Self::new(status, headers, Bytes::from(body))
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            "application/json".parse().expect("static header value"),
        );
        Self::new(status, headers, Bytes::from(value.to_string()))
    }

    /// Buffered body bytes, if this response is not streaming.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Full(b) => Some(b),
            ResponseBody::Stream(_) => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Convert into a hyper response for the server edge.
    pub fn into_hyper(self) -> hyper::Response<EdgeBody> {
        let mut builder = hyper::Response::builder().status(self.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }

        let body = match self.body {
            ResponseBody::Full(bytes) => Body::from(bytes)
                .map_err(|e| Box::new(e) as BoxError)
                .boxed_unsync(),
            ResponseBody::Stream(stream) => stream,
        };

        builder
            .body(body)
            .expect("response construction from valid parts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_is_json() {
        let resp = GatewayResponse::error(StatusCode::BAD_GATEWAY, "upstream unavailable");
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers.get("content-type").unwrap(),
            "application/json"
        );
        let body = resp.body_bytes().unwrap();
        assert_eq!(&body[..], br#"{"error":"upstream unavailable"}"#);
    }

    #[test]
    fn error_response_escapes_quotes() {
        let resp = GatewayResponse::error(StatusCode::FORBIDDEN, r#"role "x" missing"#);
        let body = String::from_utf8(resp.body_bytes().unwrap().to_vec()).unwrap();
        assert!(body.contains(r#"role \"x\" missing"#));
    }
}
