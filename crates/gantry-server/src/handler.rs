//! The proxy handler: middleware chain, routing, backend dispatch, and
//! completion accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use gantry_core::context::keys;
use gantry_core::{Body, GatewayError, GatewayRequest, GatewayResponse, Result};
use gantry_routing::{ProtocolHint, RouteResult, Router};
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connector::Connector;
use crate::middleware::{run_request_chain, run_response_chain, Middleware};
use crate::sse::{accept_allows_event_stream, SseParser, SseWriter, EVENT_STREAM_CONTENT_TYPE};

/// Drives one request end to end.
///
/// Completion statistics for the selected instance are reported here, once
/// per request, after the backend produced headers (or failed). Streamed
/// bodies may continue past that point; the statistic is eventually
/// consistent by design.
#[derive(Debug)]
pub struct RequestHandler {
    chain: Vec<Arc<dyn Middleware>>,
    router: Arc<Router>,
    connector: Arc<dyn Connector>,
    default_timeout: Duration,
    sse_keepalive: Duration,
}

impl RequestHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(
        chain: Vec<Arc<dyn Middleware>>,
        router: Arc<Router>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            chain,
            router,
            connector,
            default_timeout: Duration::from_secs(30),
            sse_keepalive: Duration::from_secs(15),
        }
    }

    /// Sets the default per-request timeout (rules may override).
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the SSE keepalive cadence; zero disables keepalives.
    #[must_use]
    pub fn with_sse_keepalive(mut self, keepalive: Duration) -> Self {
        self.sse_keepalive = keepalive;
        self
    }

    /// The router behind this handler.
    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Handles one request; the returned response may carry a streaming
    /// body.
    pub async fn handle(&self, request: &mut GatewayRequest) -> Result<GatewayResponse> {
        run_request_chain(&self.chain, request).await?;

        let route = self.router.route(request).map_err(GatewayError::from)?;
        request.context.insert(keys::ROUTE_ID, route.rule.id.clone());
        request
            .context
            .insert(keys::ROUTE_SERVICE, route.service_name.clone());

        let sse_route = route.rule.protocol == ProtocolHint::Sse;
        if sse_route && !accept_allows_event_stream(request.header("accept")) {
            // 406 sits outside the error taxonomy; answer it directly.
            return Ok(GatewayResponse::json(
                StatusCode::NOT_ACCEPTABLE,
                &serde_json::json!({
                    "error": "not_acceptable",
                    "message": "accept must allow text/event-stream",
                }),
            ));
        }

        let timeout = route.rule.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            timeout,
            self.connector.connect(&route.instance, request),
        )
        .await;

        let response = match outcome {
            Err(_) => {
                route
                    .rule
                    .balancer
                    .record_result(&route.instance.id, false, started.elapsed());
                return Err(GatewayError::timeout("backend request timed out")
                    .with_detail("service", route.service_name.clone())
                    .with_detail("instance", route.instance.id.clone()));
            }
            Ok(Err(err)) => {
                route
                    .rule
                    .balancer
                    .record_result(&route.instance.id, false, started.elapsed());
                return Err(err);
            }
            Ok(Ok(response)) => response,
        };

        let success = response.status.as_u16() < 500;
        route
            .rule
            .balancer
            .record_result(&route.instance.id, success, started.elapsed());

        let mut response = if Self::should_frame_sse(&route, sse_route, &response) {
            self.frame_sse(request, response)
        } else {
            response
        };

        run_response_chain(&self.chain, request, &mut response);
        Ok(response)
    }

    /// Renders an error the way the front end sends it, with the error-level
    /// log the taxonomy requires.
    #[must_use]
    pub fn render_error(request: &GatewayRequest, err: &GatewayError) -> GatewayResponse {
        error!(
            id = request.id,
            trace = %request.trace_id,
            kind = %err.kind,
            cause = %err.source.as_ref().map(ToString::to_string).unwrap_or_default(),
            details = %err.details_for_log(),
            "{err}"
        );
        GatewayResponse::from_error(err)
    }

    fn should_frame_sse(route: &RouteResult, sse_route: bool, response: &GatewayResponse) -> bool {
        if sse_route {
            return true;
        }
        route.rule.protocol == ProtocolHint::Auto
            && response
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with(EVENT_STREAM_CONTENT_TYPE))
    }

    /// Re-frames the backend's SSE byte stream through the writer so every
    /// frame the client sees is well-formed and flushed individually, with
    /// keepalive comments on the configured cadence.
    fn frame_sse(&self, request: &GatewayRequest, backend: GatewayResponse) -> GatewayResponse {
        let (writer, rx) = SseWriter::channel(32);
        let cancel: CancellationToken = request.context.cancellation().clone();
        let keepalive = self.sse_keepalive;
        let mut upstream = backend.body.into_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let tick_period = if keepalive.is_zero() {
                Duration::from_secs(3600)
            } else {
                keepalive
            };
            let mut ticker = tokio::time::interval(tick_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Client cancelled sse stream");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !keepalive.is_zero() && writer.comment("keepalive").await.is_err() {
                            break;
                        }
                    }
                    chunk = upstream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            let mut client_gone = false;
                            for event in parser.feed(&bytes) {
                                if writer.send(&event).await.is_err() {
                                    client_gone = true;
                                    break;
                                }
                            }
                            if client_gone {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "Backend sse stream failed");
                            writer.error_frame(&err.to_string()).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (Ok(bytes), rx))
        })
        .boxed();

        GatewayResponse {
            status: backend.status,
            headers: backend.headers,
            body: Body::from_stream(stream),
        }
        .with_header(http::header::CONTENT_TYPE.as_str(), EVENT_STREAM_CONTENT_TYPE)
        .with_header(http::header::CACHE_CONTROL.as_str(), "no-cache")
        .with_header(http::header::CONNECTION.as_str(), "keep-alive")
        .with_header("X-Accel-Buffering", "no")
    }
}
