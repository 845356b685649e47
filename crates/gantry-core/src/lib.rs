//! # gantry-core
//!
//! Shared vocabulary for the Gantry API gateway: the uniform request and
//! response views that front-end adapters produce, the per-request context
//! that middleware reads and writes, and the error taxonomy every layer maps
//! into front-end status codes.
//!
//! Front-end adapters (HTTP, SSE, WebSocket) terminate their protocol and
//! build a [`GatewayRequest`]; the middleware chain and router only ever see
//! that view, never the transport-specific types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod request;

pub use context::RequestContext;
pub use error::{ErrorKind, GatewayError, Result};
pub use request::{Body, GatewayRequest, GatewayResponse};
