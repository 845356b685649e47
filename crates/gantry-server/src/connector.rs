//! The backend connector capability.
//!
//! The data plane never talks to backends directly; it hands the selected
//! instance and the uniform request to a [`Connector`], which opens the
//! backend call and returns a streaming response. Concrete gRPC transports
//! live behind the same seam; the default connector speaks HTTP(S) and
//! covers request/response and SSE traffic.

use std::fmt;

use async_trait::async_trait;
use futures::StreamExt;
use gantry_core::{Body, ErrorKind, GatewayError, GatewayRequest, GatewayResponse, Result};
use gantry_discovery::{Scheme, ServiceInstance};
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

/// Hop-by-hop headers; never forwarded in either direction.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Opens a backend connection for a routed request.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Sends the request to `instance`, returning the streaming response.
    ///
    /// Takes the request body; the caller must not reuse it.
    async fn connect(
        &self,
        instance: &ServiceInstance,
        request: &mut GatewayRequest,
    ) -> Result<GatewayResponse>;
}

/// HTTP(S) connector over a shared client with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConnector {
    /// Creates a connector with a pooled client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Target URL on the instance for this request.
    #[must_use]
    pub fn backend_url(instance: &ServiceInstance, request: &GatewayRequest) -> String {
        // WebSocket-scheme instances are still dialed over HTTP here; the
        // WebSocket adapter performs its own upgrade.
        let scheme = match instance.scheme {
            Scheme::Https | Scheme::Wss => "https",
            Scheme::Http | Scheme::Ws | Scheme::Grpc => "http",
        };
        let path_and_query = request
            .uri
            .path_and_query()
            .map_or_else(|| request.path.clone(), |pq| pq.as_str().to_string());
        format!("{scheme}://{}{path_and_query}", instance.authority())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        instance: &ServiceInstance,
        request: &mut GatewayRequest,
    ) -> Result<GatewayResponse> {
        let url = Self::backend_url(instance, request);

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|_| GatewayError::bad_request("unsupported method"))?;

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(http::header::HOST);

        let body = std::mem::take(&mut request.body);
        let builder = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_stream()));

        debug!(url = %url, instance = %instance.id, "Dispatching to backend");

        let response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Backend request failed");
            let kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::Unavailable
            };
            GatewayError::new(kind, "backend unreachable")
                .with_detail("instance", instance.id.clone())
                .with_source(e)
        })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(name.as_str()),
                http::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.insert(name, value);
            }
        }
        strip_hop_by_hop(&mut response_headers);

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| {
                    GatewayError::unavailable("backend stream interrupted").with_source(e)
                })
            })
            .boxed();

        Ok(GatewayResponse {
            status,
            headers: response_headers,
            body: Body::from_stream(stream),
        })
    }
}
