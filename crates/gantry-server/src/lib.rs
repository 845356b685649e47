//! # gantry-server
//!
//! The gateway's front end: the HTTP adapter (request/response and SSE),
//! the WebSocket adapter, the middleware chain (tracking, versioning,
//! RBAC), the backend connector, configuration, and the bootstrap that
//! wires everything to the discovery registry and router.
//!
//! ## Architecture
//!
//! ```text
//! listener ──► uniform request ──► middleware chain ──► router ──► balancer
//!                                                                      │
//! client ◄── streamed response ◄── connector ◄── selected instance ◄───┘
//! ```
//!
//! Each accepted connection runs on its own task; the per-request context
//! carries the cancellation root, parented to the adapter's stop signal so
//! graceful shutdown reaches every in-flight request.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod connector;
pub mod error;
pub mod handler;
pub mod http;
pub mod middleware;
pub mod sse;
pub mod versioning;
pub mod websocket;

pub use config::{GatewayConfig, HttpListenerConfig, WsListenerConfig};
pub use connector::{Connector, HttpConnector};
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use http::HttpAdapter;
pub use middleware::{Middleware, RbacLayer, SubjectLayer, TrackingLayer};
pub use sse::{SseEvent, SseParser, SseWriter};
pub use versioning::{VersioningConfig, VersioningLayer};
pub use websocket::{TokenValidator, WsAdapter};
