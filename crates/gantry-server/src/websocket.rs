//! The WebSocket front-end adapter.
//!
//! Accepts upgrades on its own listener, routes the handshake through the
//! shared middleware chain and router (the synthetic `WEBSOCKET` method and
//! `GET` both match), opens the backend connection, and runs one
//! forwarding loop over both half-streams: text and binary frames pass
//! verbatim, pings are answered with pongs within a one-second deadline,
//! and close frames propagate with their code and reason. Either side
//! ending the stream closes the other.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use gantry_core::{GatewayRequest, RequestContext, Result};
use gantry_discovery::Scheme;
use gantry_routing::{Router, RoutingError};
use http::Method;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, connect_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WsListenerConfig;
use crate::error::{ServerError, ServerResult};
use crate::middleware::{run_request_chain, Middleware};

/// Deadline for answering a ping with a pong.
const PONG_DEADLINE: Duration = Duration::from_secs(1);

/// Headers forwarded to the backend during the upgrade.
const FORWARDED_HEADERS: [&str; 6] = [
    "cookie",
    "authorization",
    "x-session-id",
    "x-request-id",
    "x-forwarded-for",
    "x-auth-subject",
];

/// Optional bearer-token hook: validated at handshake, and the connection
/// closes when the returned remaining lifetime lapses.
pub trait TokenValidator: Send + Sync + fmt::Debug {
    /// Validates the handshake request; `Ok(Some(d))` arms an expiry timer.
    fn validate(&self, request: &GatewayRequest) -> Result<Option<Duration>>;
}

/// The WebSocket listener.
#[derive(Debug)]
pub struct WsAdapter {
    config: WsListenerConfig,
    chain: Vec<Arc<dyn Middleware>>,
    router: Arc<Router>,
    validator: Option<Arc<dyn TokenValidator>>,
    request_counter: AtomicU64,
    stop: CancellationToken,
}

impl WsAdapter {
    /// Creates an adapter sharing the HTTP middleware chain and router.
    #[must_use]
    pub fn new(
        config: WsListenerConfig,
        chain: Vec<Arc<dyn Middleware>>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            config,
            chain,
            router,
            validator: None,
            request_counter: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    /// Installs a token validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Stops accepting connections and cancels active pumps.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.max_message_size);
        config.max_frame_size = Some(self.config.max_message_size);
        config
    }

    /// Accepts connections until stopped.
    pub async fn serve(self: Arc<Self>) -> ServerResult<()> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr.clone(), e))?;
        info!(addr = %addr, "Websocket adapter listening");

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let adapter = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = adapter.handle_connection(stream, peer).await {
                                    debug!(peer = %peer, error = %e, "Websocket session ended");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        info!(addr = %addr, "Websocket adapter stopped");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> ServerResult<()> {
        let captured: Arc<Mutex<Option<(String, http::HeaderMap)>>> =
            Arc::new(Mutex::new(None));
        let capture = Arc::clone(&captured);

        let callback = move |req: &HandshakeRequest,
                             response: HandshakeResponse|
              -> std::result::Result<HandshakeResponse, ErrorResponse> {
            *capture.lock() = Some((req.uri().to_string(), req.headers().clone()));
            Ok(response)
        };

        let mut client = accept_hdr_async_with_config(stream, callback, Some(self.ws_config()))
            .await
            .map_err(|e| ServerError::Handshake(e.to_string()))?;

        let Some((uri, headers)) = captured.lock().take() else {
            return Err(ServerError::Handshake("handshake captured no request".to_string()));
        };

        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let websocket_method =
            Method::from_bytes(b"WEBSOCKET").unwrap_or(Method::GET);
        let mut request = GatewayRequest::builder(websocket_method, &uri)
            .id(id)
            .remote_addr(peer)
            .headers(headers)
            .context(RequestContext::with_parent(&self.stop))
            .build();

        if let Err(err) = run_request_chain(&self.chain, &mut request).await {
            warn!(peer = %peer, error = %err, "Websocket handshake rejected by middleware");
            close_with(&mut client, CloseCode::Policy, &err.to_string()).await;
            return Ok(());
        }

        let expiry = match self.validator.as_ref().map(|v| v.validate(&request)) {
            Some(Ok(expiry)) => expiry,
            Some(Err(err)) => {
                close_with(&mut client, CloseCode::Policy, &err.to_string()).await;
                return Ok(());
            }
            None => None,
        };

        let route = match self.route_handshake(&mut request) {
            Ok(route) => route,
            Err(err) => {
                close_with(&mut client, CloseCode::Policy, &err.to_string()).await;
                return Ok(());
            }
        };

        let backend_url = backend_ws_url(&route.instance.scheme, &route.instance.authority(), &uri);
        let mut backend_request = into_client_request(&backend_url)?;
        for name in FORWARDED_HEADERS {
            if let Some(value) = request.headers.get(name) {
                if let Ok(header) = http::header::HeaderName::try_from(name) {
                    backend_request.headers_mut().insert(header, value.clone());
                }
            }
        }

        let started = Instant::now();
        let (backend, _) =
            match connect_async_with_config(backend_request, Some(self.ws_config()), false).await {
                Ok(connected) => connected,
                Err(e) => {
                    warn!(
                        instance = %route.instance.id,
                        error = %e,
                        "Backend websocket connect failed"
                    );
                    route
                        .rule
                        .balancer
                        .record_result(&route.instance.id, false, started.elapsed());
                    close_with(&mut client, CloseCode::Error, "backend unavailable").await;
                    return Ok(());
                }
            };

        info!(
            peer = %peer,
            instance = %route.instance.id,
            service = %route.service_name,
            "Websocket session established"
        );

        let clean = self.pump(client, backend, expiry).await;
        route
            .rule
            .balancer
            .record_result(&route.instance.id, clean, started.elapsed());

        debug!(peer = %peer, clean, "Websocket session finished");
        Ok(())
    }

    /// Routes the handshake: the synthetic method first, `GET` as the
    /// equivalent fallback.
    fn route_handshake(
        &self,
        request: &mut GatewayRequest,
    ) -> std::result::Result<gantry_routing::RouteResult, RoutingError> {
        match self.router.route(request) {
            Err(RoutingError::NoRouteMatched(_)) => {
                request.method = Method::GET;
                self.router.route(request)
            }
            other => other,
        }
    }

    /// The forwarding loop. Returns true when the session ended cleanly
    /// (either side closed or hung up, no transport error).
    async fn pump(
        &self,
        client: tokio_tungstenite::WebSocketStream<TcpStream>,
        backend: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
        expiry: Option<Duration>,
    ) -> bool {
        let (mut client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = backend.split();

        let read_timeout = Duration::from_secs(self.config.read_timeout);
        let write_timeout = Duration::from_secs(self.config.write_timeout);

        let expiry_sleep = tokio::time::sleep(expiry.unwrap_or(Duration::from_secs(86_400)));
        tokio::pin!(expiry_sleep);

        let mut clean = true;
        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    let frame = close_frame(CloseCode::Away, "gateway shutting down");
                    client_tx.send(Message::Close(frame.clone())).await.ok();
                    backend_tx.send(Message::Close(frame)).await.ok();
                    break;
                }
                () = &mut expiry_sleep, if expiry.is_some() => {
                    let frame = close_frame(CloseCode::Policy, "token expired");
                    client_tx.send(Message::Close(frame.clone())).await.ok();
                    backend_tx.send(Message::Close(frame)).await.ok();
                    break;
                }
                incoming = tokio::time::timeout(read_timeout, client_rx.next()) => {
                    match incoming {
                        Err(_) => {
                            let frame = close_frame(CloseCode::Away, "read timeout");
                            client_tx.send(Message::Close(frame.clone())).await.ok();
                            backend_tx.send(Message::Close(frame)).await.ok();
                            break;
                        }
                        Ok(None) => {
                            backend_tx.send(Message::Close(None)).await.ok();
                            break;
                        }
                        Ok(Some(Err(e))) => {
                            debug!(error = %e, "Client websocket error");
                            backend_tx.send(Message::Close(None)).await.ok();
                            clean = false;
                            break;
                        }
                        Ok(Some(Ok(message))) => match message {
                            Message::Ping(payload) => {
                                let pong = client_tx.send(Message::Pong(payload));
                                if tokio::time::timeout(PONG_DEADLINE, pong)
                                    .await
                                    .map_or(true, |sent| sent.is_err())
                                {
                                    clean = false;
                                    break;
                                }
                            }
                            Message::Pong(_) => {}
                            Message::Close(frame) => {
                                backend_tx.send(Message::Close(frame)).await.ok();
                                break;
                            }
                            message => {
                                let forward = backend_tx.send(message);
                                if tokio::time::timeout(write_timeout, forward)
                                    .await
                                    .map_or(true, |sent| sent.is_err())
                                {
                                    clean = false;
                                    break;
                                }
                            }
                        },
                    }
                }
                outgoing = backend_rx.next() => {
                    match outgoing {
                        None => {
                            client_tx.send(Message::Close(None)).await.ok();
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "Backend websocket error");
                            let frame = close_frame(CloseCode::Error, "backend stream failed");
                            client_tx.send(Message::Close(frame)).await.ok();
                            clean = false;
                            break;
                        }
                        Some(Ok(message)) => match message {
                            Message::Ping(payload) => {
                                let pong = backend_tx.send(Message::Pong(payload));
                                if tokio::time::timeout(PONG_DEADLINE, pong)
                                    .await
                                    .map_or(true, |sent| sent.is_err())
                                {
                                    clean = false;
                                    break;
                                }
                            }
                            Message::Pong(_) => {}
                            Message::Close(frame) => {
                                client_tx.send(Message::Close(frame)).await.ok();
                                break;
                            }
                            message => {
                                let forward = client_tx.send(message);
                                if tokio::time::timeout(write_timeout, forward)
                                    .await
                                    .map_or(true, |sent| sent.is_err())
                                {
                                    clean = false;
                                    break;
                                }
                            }
                        },
                    }
                }
            }
        }
        clean
    }
}

fn close_frame(code: CloseCode, reason: &str) -> Option<CloseFrame<'static>> {
    Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    })
}

async fn close_with(
    client: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    code: CloseCode,
    reason: &str,
) {
    client
        .send(Message::Close(close_frame(code, reason)))
        .await
        .ok();
}

/// Backend websocket URL for the selected instance.
fn backend_ws_url(scheme: &Scheme, authority: &str, uri: &str) -> String {
    let ws_scheme = match scheme {
        Scheme::Wss | Scheme::Https => "wss",
        Scheme::Ws | Scheme::Http | Scheme::Grpc => "ws",
    };
    format!("{ws_scheme}://{authority}{uri}")
}

fn into_client_request(
    url: &str,
) -> ServerResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    url.into_client_request()
        .map_err(|e| ServerError::Handshake(format!("invalid backend url {url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::TrackingLayer;
    use gantry_discovery::{Registry, ServiceInstance, SharedRegistry, StaticSource};
    use gantry_routing::RouteRule;

    // ==================== URL Construction Tests ====================

    #[test]
    fn test_backend_ws_url_schemes() {
        assert_eq!(
            backend_ws_url(&Scheme::Ws, "10.0.0.1:9000", "/socket"),
            "ws://10.0.0.1:9000/socket"
        );
        assert_eq!(
            backend_ws_url(&Scheme::Wss, "10.0.0.1:9000", "/socket"),
            "wss://10.0.0.1:9000/socket"
        );
        assert_eq!(
            backend_ws_url(&Scheme::Http, "10.0.0.1:9000", "/socket?x=1"),
            "ws://10.0.0.1:9000/socket?x=1"
        );
    }

    #[test]
    fn test_into_client_request() {
        assert!(into_client_request("ws://10.0.0.1:9000/socket").is_ok());
        assert!(into_client_request("not a url").is_err());
    }

    // ==================== Routing Tests ====================

    async fn adapter_with_rule(methods: &[&str]) -> Arc<WsAdapter> {
        let source = StaticSource::new()
            .with_instance(ServiceInstance::builder("w1", "ws-service", "10.0.0.1", 9000).build());
        let registry = Arc::new(SharedRegistry::new(Box::new(source)));
        registry.refresh().await.ok();

        let router = Arc::new(Router::new(registry as Arc<dyn Registry>));
        router
            .add_rule(
                RouteRule::builder("ws", "/socket", "ws-service")
                    .methods(methods)
                    .build()
                    .ok()
                    .unwrap(),
            )
            .ok();

        let config = WsListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_message_size: 1024,
            read_timeout: 60,
            write_timeout: 5,
        };
        Arc::new(WsAdapter::new(
            config,
            vec![Arc::new(TrackingLayer::new())],
            router,
        ))
    }

    #[tokio::test]
    async fn test_handshake_routes_synthetic_method() {
        let adapter = adapter_with_rule(&["WEBSOCKET"]).await;
        let mut request = GatewayRequest::builder(
            Method::from_bytes(b"WEBSOCKET").ok().unwrap(),
            "/socket",
        )
        .build();

        let route = adapter.route_handshake(&mut request).ok().unwrap();
        assert_eq!(route.instance.id, "w1");
    }

    #[tokio::test]
    async fn test_handshake_falls_back_to_get_rule() {
        let adapter = adapter_with_rule(&["GET"]).await;
        let mut request = GatewayRequest::builder(
            Method::from_bytes(b"WEBSOCKET").ok().unwrap(),
            "/socket",
        )
        .build();

        let route = adapter.route_handshake(&mut request).ok().unwrap();
        assert_eq!(route.service_name, "ws-service");
    }

    #[tokio::test]
    async fn test_handshake_unknown_path_fails() {
        let adapter = adapter_with_rule(&["GET"]).await;
        let mut request = GatewayRequest::builder(Method::GET, "/other").build();
        assert!(adapter.route_handshake(&mut request).is_err());
    }

    // ==================== Config Tests ====================

    #[tokio::test]
    async fn test_ws_config_applies_limits() {
        let adapter = adapter_with_rule(&[]).await;
        let config = adapter.ws_config();
        assert_eq!(config.max_message_size, Some(1024));
        assert_eq!(config.max_frame_size, Some(1024));
    }
}
