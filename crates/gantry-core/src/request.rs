//! The uniform request/response contract.
//!
//! Every front-end adapter terminates its own protocol and produces a
//! [`GatewayRequest`]; everything downstream (middleware, router, connector)
//! works against this view only. Bodies are streams, never buffered by the
//! contract itself.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};

/// A request or response body.
///
/// `Stream` is the general form; `Empty` and `Full` avoid allocating a
/// stream for the common cases.
pub enum Body {
    /// No body.
    Empty,
    /// A fully materialized body.
    Full(Bytes),
    /// A streaming body; chunks arrive as the transport delivers them.
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl Body {
    /// Creates an empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Creates a body from in-memory bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Full(bytes.into())
    }

    /// Creates a streaming body.
    #[must_use]
    pub fn from_stream(stream: BoxStream<'static, Result<Bytes>>) -> Self {
        Self::Stream(stream)
    }

    /// Returns true for [`Body::Empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Converts any body form into a chunk stream.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        match self {
            Self::Empty => stream::empty().boxed(),
            Self::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Self::Stream(s) => s,
        }
    }

    /// Collects the whole body into memory.
    ///
    /// Only used by tests and by middleware that must inspect small bodies;
    /// the proxy path never calls this.
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Full(bytes) => Ok(bytes),
            Self::Stream(mut s) => {
                let mut buf = Vec::new();
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self::Full(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Full(Bytes::from(s))
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

/// The uniform, adapter-independent view of an in-flight call.
#[derive(Debug)]
pub struct GatewayRequest {
    /// Monotonically increasing id assigned by the accepting adapter.
    pub id: u64,
    /// Correlation id: incoming `X-Request-Id` if present, else generated.
    pub trace_id: String,
    /// Request method. WebSocket handshakes may carry the synthetic
    /// `WEBSOCKET` method in addition to `GET`.
    pub method: Method,
    /// Decoded path component.
    pub path: String,
    /// Full request URI as received.
    pub uri: Uri,
    /// Peer address of the client connection.
    pub remote_addr: SocketAddr,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Body,
    /// Per-request context (middleware values + cancellation root).
    pub context: RequestContext,
}

impl GatewayRequest {
    /// Starts building a request.
    #[must_use]
    pub fn builder(method: Method, uri: impl AsRef<str>) -> GatewayRequestBuilder {
        GatewayRequestBuilder::new(method, uri)
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the value of a cookie from the `Cookie` header.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header(http::header::COOKIE.as_str())?;
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            if key == name {
                return parts.next().map(|v| v.trim().to_string());
            }
        }
        None
    }

    /// Returns the value of a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if parts.next() == Some(name) {
                return Some(parts.next().unwrap_or("").to_string());
            }
        }
        None
    }

    /// Client IP: the host part of the peer address.
    #[must_use]
    pub fn client_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }
}

/// Builder for [`GatewayRequest`]; used by adapters and heavily by tests.
#[derive(Debug)]
pub struct GatewayRequestBuilder {
    id: u64,
    trace_id: Option<String>,
    method: Method,
    uri: String,
    remote_addr: SocketAddr,
    headers: HeaderMap,
    body: Body,
    context: RequestContext,
}

impl GatewayRequestBuilder {
    fn new(method: Method, uri: impl AsRef<str>) -> Self {
        Self {
            id: 0,
            trace_id: None,
            method,
            uri: uri.as_ref().to_string(),
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            headers: HeaderMap::new(),
            body: Body::Empty,
            context: RequestContext::new(),
        }
    }

    /// Sets the adapter-assigned request id.
    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Sets the correlation id explicitly.
    #[must_use]
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Sets the peer address.
    #[must_use]
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    /// Adds a header. Invalid names or values are ignored.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name),
            http::header::HeaderValue::try_from(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Replaces the header map wholesale.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Replaces the context.
    #[must_use]
    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Builds the request.
    ///
    /// An unparseable URI falls back to `/`, and the trace id falls back to
    /// the incoming `X-Request-Id` header or a fresh UUID.
    #[must_use]
    pub fn build(self) -> GatewayRequest {
        let uri: Uri = self.uri.parse().unwrap_or_else(|_| Uri::from_static("/"));
        let path = uri.path().to_string();
        let trace_id = self
            .trace_id
            .or_else(|| {
                self.headers
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        GatewayRequest {
            id: self.id,
            trace_id,
            method: self.method,
            path,
            uri,
            remote_addr: self.remote_addr,
            headers: self.headers,
            body: self.body,
            context: self.context,
        }
    }
}

/// The uniform response view streamed back to the client.
#[derive(Debug)]
pub struct GatewayResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Body,
}

impl GatewayResponse {
    /// Creates a response with an empty body.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// Sets a header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name),
            http::header::HeaderValue::try_from(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds a JSON response from a serializable value.
    #[must_use]
    pub fn json(status: StatusCode, value: &impl serde::Serialize) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(status)
            .with_header(
                http::header::CONTENT_TYPE.as_str(),
                "application/json",
            )
            .with_body(Bytes::from(body))
    }

    /// Renders a [`GatewayError`] into its front-end response.
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": err.kind.as_str(),
            "message": err.message,
        });
        Self::json(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Body Tests ====================

    #[tokio::test]
    async fn test_body_empty_collects_to_nothing() {
        let body = Body::empty();
        assert!(body.is_empty());
        assert_eq!(body.collect().await.ok(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_body_full_round_trip() {
        let body = Body::from_bytes(Bytes::from_static(b"hello"));
        let collected = body.collect().await.ok();
        assert_eq!(collected, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_body_stream_collects_in_order() {
        let chunks = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"bc"))];
        let body = Body::from_stream(stream::iter(chunks).boxed());
        let collected = body.collect().await.ok();
        assert_eq!(collected, Some(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_body_into_stream_from_full() {
        let body = Body::from_bytes(Bytes::from_static(b"xyz"));
        let mut s = body.into_stream();
        let first = s.next().await;
        assert!(matches!(first, Some(Ok(b)) if b == Bytes::from_static(b"xyz")));
        assert!(s.next().await.is_none());
    }

    #[test]
    fn test_body_debug() {
        assert_eq!(format!("{:?}", Body::Empty), "Body::Empty");
        assert_eq!(
            format!("{:?}", Body::from_bytes(Bytes::from_static(b"abc"))),
            "Body::Full(3 bytes)"
        );
    }

    // ==================== Request Builder Tests ====================

    #[test]
    fn test_builder_basic() {
        let req = GatewayRequest::builder(Method::GET, "/api/users?limit=5")
            .id(7)
            .build();

        assert_eq!(req.id, 7);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path, "/api/users");
        assert_eq!(req.uri.query(), Some("limit=5"));
    }

    #[test]
    fn test_builder_honors_incoming_request_id() {
        let req = GatewayRequest::builder(Method::GET, "/")
            .header("x-request-id", "abc-123")
            .build();
        assert_eq!(req.trace_id, "abc-123");
    }

    #[test]
    fn test_builder_generates_trace_id() {
        let req = GatewayRequest::builder(Method::GET, "/").build();
        assert!(!req.trace_id.is_empty());
    }

    #[test]
    fn test_builder_invalid_uri_falls_back() {
        let req = GatewayRequest::builder(Method::GET, "not a uri").build();
        assert_eq!(req.path, "/");
    }

    // ==================== Header / Cookie / Query Tests ====================

    #[test]
    fn test_header_lookup() {
        let req = GatewayRequest::builder(Method::GET, "/")
            .header("x-session-id", "s-1")
            .build();
        assert_eq!(req.header("x-session-id"), Some("s-1"));
        assert_eq!(req.header("X-Session-Id"), Some("s-1"));
        assert!(req.header("missing").is_none());
    }

    #[test]
    fn test_cookie_parsing() {
        let req = GatewayRequest::builder(Method::GET, "/")
            .header("cookie", "a=1; session=abc; b=2")
            .build();
        assert_eq!(req.cookie("session"), Some("abc".to_string()));
        assert_eq!(req.cookie("a"), Some("1".to_string()));
        assert!(req.cookie("missing").is_none());
    }

    #[test]
    fn test_query_param() {
        let req = GatewayRequest::builder(Method::GET, "/p?version=2&sid=xyz").build();
        assert_eq!(req.query_param("version"), Some("2".to_string()));
        assert_eq!(req.query_param("sid"), Some("xyz".to_string()));
        assert!(req.query_param("missing").is_none());
    }

    #[test]
    fn test_client_ip() {
        let req = GatewayRequest::builder(Method::GET, "/")
            .remote_addr(SocketAddr::from(([192, 168, 1, 9], 55000)))
            .build();
        assert_eq!(req.client_ip().to_string(), "192.168.1.9");
    }

    // ==================== Response Tests ====================

    #[test]
    fn test_response_builder() {
        let resp = GatewayResponse::new(StatusCode::OK)
            .with_header("x-api-version", "2")
            .with_body("ok");

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(
            resp.headers.get("x-api-version").map(|v| v.to_str().ok()),
            Some(Some("2"))
        );
    }

    #[tokio::test]
    async fn test_response_from_error() {
        let err = GatewayError::unavailable("no healthy instance");
        let resp = GatewayResponse::from_error(&err);

        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        let body = resp.body.collect().await.ok().unwrap_or_default();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
        assert_eq!(parsed["error"], "unavailable");
        assert_eq!(parsed["message"], "no healthy instance");
    }
}
