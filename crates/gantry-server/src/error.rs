//! Error types for the server crate.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while running the gateway.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind a listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),

    /// A WebSocket handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// Configuration was invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Discovery failed during bootstrap.
    #[error("discovery error: {0}")]
    Discovery(#[from] gantry_discovery::DiscoveryError),

    /// A route failed to install during bootstrap.
    #[error("routing error: {0}")]
    Routing(#[from] gantry_routing::RoutingError),

    /// A policy failed to load during bootstrap.
    #[error("rbac error: {0}")]
    Auth(#[from] gantry_auth::AuthError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failed_display() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = ServerError::BindFailed("127.0.0.1:8080".to_string(), io);
        let message = err.to_string();
        assert!(message.contains("127.0.0.1:8080"));
        assert!(message.contains("address in use"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: ServerError = ConfigError::Invalid("missing port".to_string()).into();
        assert!(err.to_string().contains("missing port"));
    }

    #[test]
    fn test_discovery_error_converts() {
        let err: ServerError =
            gantry_discovery::DiscoveryError::ServiceNotFound("svc".to_string()).into();
        assert!(matches!(err, ServerError::Discovery(_)));
    }
}
