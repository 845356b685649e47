//! Error taxonomy shared by every gateway layer.
//!
//! Each error carries a [`ErrorKind`] that maps to exactly one front-end
//! status code, a user-visible message, an optional underlying cause, and a
//! free-form detail map. Wrapping a structured error preserves its kind, so
//! middleware can add context without obscuring what actually went wrong.

use std::collections::HashMap;
use std::fmt;

/// The tagged error kinds the gateway distinguishes at its edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or rejected request (bad version, bad header).
    BadRequest,
    /// No subject could be established for an enforced request.
    Unauthorized,
    /// Subject established but the policy denies the action.
    Forbidden,
    /// No route matched, or the named service is unknown.
    NotFound,
    /// The request or a backend call exceeded its deadline.
    Timeout,
    /// The caller exceeded a configured rate limit.
    RateLimit,
    /// The service is known but has no healthy instance, or the backend
    /// could not be reached.
    Unavailable,
    /// Programming or configuration error.
    Internal,
}

impl ErrorKind {
    /// Front-end status code for this kind.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Timeout => 408,
            Self::RateLimit => 429,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }

    /// Short lowercase tag used in logs and error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured gateway error.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    /// What class of failure this is.
    pub kind: ErrorKind,
    /// User-visible message rendered into the front-end response.
    pub message: String,
    /// Underlying cause, when one exists.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Free-form details logged alongside the error (never sent to clients).
    pub details: HashMap<String, String>,
}

impl GatewayError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            details: HashMap::new(),
        }
    }

    /// Creates a `BadRequest` error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Creates an `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Creates a `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Creates a `Timeout` error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Creates a `RateLimit` error.
    #[must_use]
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attaches a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attaches an underlying cause without changing the kind.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Wraps an error with a new message.
    ///
    /// If the wrapped error is itself a [`GatewayError`] its kind and details
    /// are preserved; anything else becomes `Internal`.
    #[must_use]
    pub fn wrap(
        err: impl std::error::Error + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        let (kind, details) = match boxed.downcast_ref::<GatewayError>() {
            Some(inner) => (inner.kind, inner.details.clone()),
            None => (ErrorKind::Internal, HashMap::new()),
        };
        Self {
            kind,
            message: message.into(),
            source: Some(boxed),
            details,
        }
    }

    /// Returns the front-end status code for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    /// Renders the details map for structured logging.
    #[must_use]
    pub fn details_for_log(&self) -> String {
        if self.details.is_empty() {
            return String::new();
        }
        let mut pairs: Vec<String> = self
            .details
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        pairs.join(" ")
    }
}

/// Result type used throughout the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== ErrorKind Tests ====================

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(ErrorKind::BadRequest.status(), 400);
        assert_eq!(ErrorKind::Unauthorized.status(), 401);
        assert_eq!(ErrorKind::Forbidden.status(), 403);
        assert_eq!(ErrorKind::NotFound.status(), 404);
        assert_eq!(ErrorKind::Timeout.status(), 408);
        assert_eq!(ErrorKind::RateLimit.status(), 429);
        assert_eq!(ErrorKind::Unavailable.status(), 503);
        assert_eq!(ErrorKind::Internal.status(), 500);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
        assert_eq!(ErrorKind::Unavailable.to_string(), "unavailable");
    }

    // ==================== Constructor Tests ====================

    #[test]
    fn test_constructors_set_kind() {
        assert_eq!(GatewayError::bad_request("x").kind, ErrorKind::BadRequest);
        assert_eq!(GatewayError::unauthorized("x").kind, ErrorKind::Unauthorized);
        assert_eq!(GatewayError::forbidden("x").kind, ErrorKind::Forbidden);
        assert_eq!(GatewayError::not_found("x").kind, ErrorKind::NotFound);
        assert_eq!(GatewayError::timeout("x").kind, ErrorKind::Timeout);
        assert_eq!(GatewayError::rate_limit("x").kind, ErrorKind::RateLimit);
        assert_eq!(GatewayError::unavailable("x").kind, ErrorKind::Unavailable);
        assert_eq!(GatewayError::internal("x").kind, ErrorKind::Internal);
    }

    #[test]
    fn test_display_is_message() {
        let err = GatewayError::not_found("no route for /api/unknown");
        assert_eq!(err.to_string(), "no route for /api/unknown");
    }

    #[test]
    fn test_with_detail() {
        let err = GatewayError::not_found("unknown service")
            .with_detail("service", "user-service");
        assert_eq!(err.details.get("service"), Some(&"user-service".to_string()));
    }

    // ==================== Wrap Tests ====================

    #[test]
    fn test_wrap_preserves_structured_kind() {
        let inner = GatewayError::unavailable("no healthy instance")
            .with_detail("service", "billing");
        let wrapped = GatewayError::wrap(inner, "routing failed");

        assert_eq!(wrapped.kind, ErrorKind::Unavailable);
        assert_eq!(wrapped.message, "routing failed");
        assert_eq!(wrapped.details.get("service"), Some(&"billing".to_string()));
        assert!(wrapped.source.is_some());
    }

    #[test]
    fn test_wrap_foreign_error_is_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let wrapped = GatewayError::wrap(io, "backend read failed");

        assert_eq!(wrapped.kind, ErrorKind::Internal);
        assert_eq!(wrapped.message, "backend read failed");
    }

    #[test]
    fn test_wrap_twice_still_preserves_kind() {
        let inner = GatewayError::forbidden("policy denies delete");
        let once = GatewayError::wrap(inner, "rbac check failed");
        let twice = GatewayError::wrap(once, "middleware chain aborted");
        assert_eq!(twice.kind, ErrorKind::Forbidden);
    }

    // ==================== Detail Logging Tests ====================

    #[test]
    fn test_details_for_log_sorted() {
        let err = GatewayError::internal("x")
            .with_detail("b", "2")
            .with_detail("a", "1");
        assert_eq!(err.details_for_log(), "a=1 b=2");
    }

    #[test]
    fn test_details_for_log_empty() {
        let err = GatewayError::internal("x");
        assert_eq!(err.details_for_log(), "");
    }

    #[test]
    fn test_status_shortcut() {
        assert_eq!(GatewayError::rate_limit("slow down").status(), 429);
    }
}
