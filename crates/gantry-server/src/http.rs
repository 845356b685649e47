//! The HTTP front-end adapter.
//!
//! Accepts connections, builds the uniform request view (request id,
//! forwarded headers, streamed body), answers the health endpoints before
//! routing, and streams the handler's response back. Request bodies are
//! never buffered here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use gantry_core::{Body, ErrorKind, GatewayError, GatewayRequest, GatewayResponse, RequestContext};
use gantry_discovery::Registry;
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HttpListenerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;

type HyperResponse = hyper::Response<UnsyncBoxBody<Bytes, GatewayError>>;

/// The HTTP listener.
#[derive(Debug)]
pub struct HttpAdapter {
    config: HttpListenerConfig,
    handler: Arc<RequestHandler>,
    registry: Arc<dyn Registry>,
    request_counter: AtomicU64,
    inflight: Arc<AtomicUsize>,
    stop: CancellationToken,
}

impl HttpAdapter {
    /// Creates an adapter.
    #[must_use]
    pub fn new(
        config: HttpListenerConfig,
        handler: Arc<RequestHandler>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            config,
            handler,
            registry,
            request_counter: AtomicU64::new(0),
            inflight: Arc::new(AtomicUsize::new(0)),
            stop: CancellationToken::new(),
        }
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Stops accepting new connections.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits for in-flight requests to finish, up to `deadline`.
    pub async fn drain(&self, deadline: Duration) {
        self.stop();
        let start = tokio::time::Instant::now();
        while self.inflight() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.inflight();
        if remaining > 0 {
            warn!(remaining, "Drain deadline reached with requests in flight");
        }
    }

    /// Accepts connections until stopped.
    pub async fn serve(self: Arc<Self>) -> ServerResult<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr.clone(), e))?;
        info!(addr = %addr, "Http adapter listening");

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let adapter = Arc::clone(&self);
                            tokio::spawn(async move {
                                adapter.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        info!(addr = %addr, "Http adapter stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let adapter = Arc::clone(&self);

        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let adapter = Arc::clone(&adapter);
            async move {
                adapter.inflight.fetch_add(1, Ordering::Relaxed);
                let response = adapter.dispatch(req, peer).await;
                adapter.inflight.fetch_sub(1, Ordering::Relaxed);
                Ok::<HyperResponse, std::convert::Infallible>(response)
            }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .await
        {
            // Clients resetting mid-request are routine.
            debug!(peer = %peer, error = %e, "Connection ended with error");
        }
    }

    async fn dispatch(&self, req: hyper::Request<Incoming>, peer: SocketAddr) -> HyperResponse {
        if self.config.health.enabled {
            if let Some(response) = self.health_response(req.uri().path()) {
                return to_hyper_response(response);
            }
        }

        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let mut request =
            build_request(req, id, peer, self.config.tls_terminated, &self.stop);

        let response = match self.handler.handle(&mut request).await {
            Ok(response) => response,
            Err(err) => RequestHandler::render_error(&request, &err),
        };
        to_hyper_response(response)
    }

    /// Answers the health endpoints independent of the router.
    fn health_response(&self, path: &str) -> Option<GatewayResponse> {
        let health = &self.config.health;
        if path == health.health || path == health.live {
            return Some(GatewayResponse::json(
                StatusCode::OK,
                &serde_json::json!({ "status": "ok" }),
            ));
        }
        if path == health.ready {
            let services = self.registry.service_names();
            let ready = !services.is_empty();
            let status = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            return Some(GatewayResponse::json(
                status,
                &serde_json::json!({
                    "status": if ready { "ready" } else { "no services discovered" },
                    "services": services.len(),
                }),
            ));
        }
        None
    }
}

/// Builds the uniform request from the transport request.
pub(crate) fn build_request(
    req: hyper::Request<Incoming>,
    id: u64,
    peer: SocketAddr,
    tls_terminated: bool,
    shutdown: &CancellationToken,
) -> GatewayRequest {
    let (parts, body) = req.into_parts();

    let stream = body
        .into_data_stream()
        .map(|chunk| {
            chunk.map_err(|e| {
                GatewayError::new(ErrorKind::BadRequest, "request body read failed").with_source(e)
            })
        })
        .boxed();

    let mut request = GatewayRequest::builder(parts.method, parts.uri.to_string())
        .id(id)
        .remote_addr(peer)
        .headers(parts.headers)
        .body(Body::from_stream(stream))
        .context(RequestContext::with_parent(shutdown))
        .build();

    apply_forwarded_headers(&mut request, tls_terminated);
    request
}

/// Sets `X-Forwarded-For/Proto/Host`; an existing `X-Forwarded-Proto` from
/// a trusted front proxy is preserved.
pub(crate) fn apply_forwarded_headers(request: &mut GatewayRequest, tls_terminated: bool) {
    let client_ip = request.client_ip().to_string();
    let forwarded_for = match request.header("x-forwarded-for") {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip,
    };
    insert_header(request, "x-forwarded-for", &forwarded_for);

    if request.header("x-forwarded-proto").is_none() {
        let proto = if tls_terminated { "https" } else { "http" };
        insert_header(request, "x-forwarded-proto", proto);
    }

    if request.header("x-forwarded-host").is_none() {
        if let Some(host) = request.header(http::header::HOST.as_str()) {
            let host = host.to_string();
            insert_header(request, "x-forwarded-host", &host);
        }
    }
}

fn insert_header(request: &mut GatewayRequest, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        http::header::HeaderName::try_from(name),
        http::header::HeaderValue::try_from(value),
    ) {
        request.headers.insert(name, value);
    }
}

/// Converts the uniform response into the transport response.
pub(crate) fn to_hyper_response(response: GatewayResponse) -> HyperResponse {
    let mut builder = hyper::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }

    let stream = response
        .body
        .into_stream()
        .map(|chunk| chunk.map(hyper::body::Frame::data));
    let body = StreamBody::new(stream).boxed_unsync();

    builder.body(body).unwrap_or_else(|_| {
        let empty = futures::stream::empty::<Result<hyper::body::Frame<Bytes>, GatewayError>>();
        hyper::Response::new(StreamBody::new(empty.boxed()).boxed_unsync())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    // ==================== Forwarded Header Tests ====================

    fn request_from(builder: gantry_core::request::GatewayRequestBuilder) -> GatewayRequest {
        builder.build()
    }

    #[test]
    fn test_forwarded_for_set_from_peer() {
        let mut request = request_from(
            GatewayRequest::builder(Method::GET, "/")
                .remote_addr(SocketAddr::from(([10, 1, 2, 3], 4000))),
        );
        apply_forwarded_headers(&mut request, false);
        assert_eq!(request.header("x-forwarded-for"), Some("10.1.2.3"));
        assert_eq!(request.header("x-forwarded-proto"), Some("http"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut request = request_from(
            GatewayRequest::builder(Method::GET, "/")
                .remote_addr(SocketAddr::from(([10, 1, 2, 3], 4000)))
                .header("x-forwarded-for", "203.0.113.7"),
        );
        apply_forwarded_headers(&mut request, false);
        assert_eq!(
            request.header("x-forwarded-for"),
            Some("203.0.113.7, 10.1.2.3")
        );
    }

    #[test]
    fn test_forwarded_proto_tls() {
        let mut request = request_from(GatewayRequest::builder(Method::GET, "/"));
        apply_forwarded_headers(&mut request, true);
        assert_eq!(request.header("x-forwarded-proto"), Some("https"));
    }

    #[test]
    fn test_existing_forwarded_proto_preserved() {
        let mut request = request_from(
            GatewayRequest::builder(Method::GET, "/").header("x-forwarded-proto", "https"),
        );
        apply_forwarded_headers(&mut request, false);
        assert_eq!(request.header("x-forwarded-proto"), Some("https"));
    }

    #[test]
    fn test_forwarded_host_from_host_header() {
        let mut request = request_from(
            GatewayRequest::builder(Method::GET, "/").header("host", "api.example.com"),
        );
        apply_forwarded_headers(&mut request, false);
        assert_eq!(request.header("x-forwarded-host"), Some("api.example.com"));
    }

    // ==================== Response Conversion Tests ====================

    #[tokio::test]
    async fn test_to_hyper_response_preserves_status_and_headers() {
        let response = GatewayResponse::new(StatusCode::CREATED)
            .with_header("x-api-version", "2")
            .with_body("done");

        let hyper_response = to_hyper_response(response);
        assert_eq!(hyper_response.status(), StatusCode::CREATED);
        assert_eq!(
            hyper_response
                .headers()
                .get("x-api-version")
                .and_then(|v| v.to_str().ok()),
            Some("2")
        );

        let collected = hyper_response.into_body().collect().await.ok().unwrap();
        assert_eq!(&collected.to_bytes()[..], b"done");
    }
}
