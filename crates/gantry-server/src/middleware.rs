//! The middleware chain layered over the proxy handler.
//!
//! `on_request` hooks run in order and may reject the request; `on_response`
//! hooks run in reverse order and may decorate the response. Layers
//! communicate through the request context (see
//! [`gantry_core::context::keys`]).

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gantry_auth::{action_for_method, AccessDecision, PolicyStore};
use gantry_core::context::keys;
use gantry_core::{GatewayError, GatewayRequest, GatewayResponse, Result};
use tracing::{debug, info};

/// One cross-cutting layer.
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Layer name, for logs.
    fn name(&self) -> &str;

    /// Inspects/mutates the request; an error short-circuits the chain.
    async fn on_request(&self, request: &mut GatewayRequest) -> Result<()>;

    /// Decorates the response after the proxy completed.
    fn on_response(&self, _request: &GatewayRequest, _response: &mut GatewayResponse) {}
}

/// Establishes the subject from a trusted front-proxy header.
///
/// Authentication proper (tokens, signatures) happens upstream; this layer
/// only moves the already-established identity into the context key the
/// RBAC layer reads.
#[derive(Debug)]
pub struct SubjectLayer {
    header: String,
}

impl SubjectLayer {
    /// Creates the layer reading `header`.
    #[must_use]
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

#[async_trait]
impl Middleware for SubjectLayer {
    fn name(&self) -> &str {
        "subject"
    }

    async fn on_request(&self, request: &mut GatewayRequest) -> Result<()> {
        if let Some(subject) = request.header(&self.header) {
            let subject = subject.to_string();
            request.context.insert(keys::AUTH_SUBJECT, subject);
        }
        Ok(())
    }
}

/// Extractor set for the RBAC layer; each piece is injectable.
pub struct RbacExtractors {
    /// Subject extractor; defaults to the `auth_subject` context key.
    pub subject: Box<dyn Fn(&GatewayRequest) -> Option<String> + Send + Sync>,
    /// Resource extractor; defaults to the request path.
    pub resource: Box<dyn Fn(&GatewayRequest) -> String + Send + Sync>,
    /// Action extractor; defaults to the method mapping.
    pub action: Box<dyn Fn(&GatewayRequest) -> String + Send + Sync>,
}

impl fmt::Debug for RbacExtractors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RbacExtractors")
    }
}

impl Default for RbacExtractors {
    fn default() -> Self {
        Self {
            subject: Box::new(|request| {
                request.context.get(keys::AUTH_SUBJECT).map(ToString::to_string)
            }),
            resource: Box::new(|request| {
                // Route-aware resources apply when a route is already in
                // context; otherwise the path is the resource.
                if let Some(service) = request.context.get(keys::ROUTE_SERVICE) {
                    return format!("service:{service}");
                }
                if let Some(route) = request.context.get(keys::ROUTE_ID) {
                    return format!("route:{route}");
                }
                request.path.clone()
            }),
            action: Box::new(|request| action_for_method(request.method.as_str())),
        }
    }
}

/// Role-based access control layer.
#[derive(Debug)]
pub struct RbacLayer {
    store: Arc<PolicyStore>,
    extractors: RbacExtractors,
}

impl RbacLayer {
    /// Creates the layer with default extractors.
    #[must_use]
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self {
            store,
            extractors: RbacExtractors::default(),
        }
    }

    /// Replaces the extractors.
    #[must_use]
    pub fn with_extractors(mut self, extractors: RbacExtractors) -> Self {
        self.extractors = extractors;
        self
    }
}

#[async_trait]
impl Middleware for RbacLayer {
    fn name(&self) -> &str {
        "rbac"
    }

    async fn on_request(&self, request: &mut GatewayRequest) -> Result<()> {
        let subject = (self.extractors.subject)(request);
        let resource = (self.extractors.resource)(request);
        let action = (self.extractors.action)(request);

        match self.store.decide(subject.as_deref(), &resource, &action) {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Unauthenticated => Err(GatewayError::unauthorized(
                "authentication required",
            )
            .with_detail("resource", resource)
            .with_detail("action", action)),
            AccessDecision::Denied(reason) => Err(GatewayError::forbidden(reason)
                .with_detail("resource", resource)
                .with_detail("action", action)),
        }
    }
}

/// Context key holding the request start time (epoch milliseconds).
const TRACK_START_KEY: &str = "track.start_ms";

/// Request tracking: correlation id on the response, latency accounting,
/// access logging.
#[derive(Debug, Default)]
pub struct TrackingLayer;

impl TrackingLayer {
    /// Creates the layer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Middleware for TrackingLayer {
    fn name(&self) -> &str {
        "tracking"
    }

    async fn on_request(&self, request: &mut GatewayRequest) -> Result<()> {
        request
            .context
            .insert(TRACK_START_KEY, Self::now_ms().to_string());
        debug!(
            id = request.id,
            trace = %request.trace_id,
            method = %request.method,
            path = %request.path,
            peer = %request.remote_addr,
            "Accepted request"
        );
        Ok(())
    }

    fn on_response(&self, request: &GatewayRequest, response: &mut GatewayResponse) {
        let elapsed_ms = request
            .context
            .get(TRACK_START_KEY)
            .and_then(|start| start.parse::<u128>().ok())
            .map(|start| Self::now_ms().saturating_sub(start));

        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from("x-request-id"),
            http::header::HeaderValue::try_from(request.trace_id.as_str()),
        ) {
            response.headers.insert(name, value);
        }

        info!(
            id = request.id,
            trace = %request.trace_id,
            method = %request.method,
            path = %request.path,
            status = response.status.as_u16(),
            elapsed_ms = elapsed_ms.unwrap_or_default() as u64,
            "Completed request"
        );
    }
}

/// Runs the chain's `on_request` hooks in order.
pub async fn run_request_chain(
    chain: &[Arc<dyn Middleware>],
    request: &mut GatewayRequest,
) -> Result<()> {
    for layer in chain {
        if let Err(err) = layer.on_request(request).await {
            debug!(layer = layer.name(), error = %err, "Middleware rejected request");
            return Err(err);
        }
    }
    Ok(())
}

/// Runs the chain's `on_response` hooks in reverse order.
pub fn run_response_chain(
    chain: &[Arc<dyn Middleware>],
    request: &GatewayRequest,
    response: &mut GatewayResponse,
) {
    for layer in chain.iter().rev() {
        layer.on_response(request, response);
    }
}
