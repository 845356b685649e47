//! Per-request context: string-keyed values plus the cancellation root.
//!
//! The context travels with the request through the middleware chain.
//! Middleware communicates downstream by inserting well-known keys (the
//! versioning layer sets [`keys::VERSION`] and [`keys::VERSION_SERVICE`],
//! the auth layer sets [`keys::AUTH_SUBJECT`]); the router reads them.
//!
//! The embedded [`CancellationToken`] is the single cancellation root for
//! the request: adapters cancel it on client disconnect or timeout, and
//! anything spawned on behalf of the request must watch it.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

/// Well-known context keys.
pub mod keys {
    /// Subject established by authentication (read by the RBAC layer).
    pub const AUTH_SUBJECT: &str = "auth_subject";
    /// API version chosen by the versioning layer.
    pub const VERSION: &str = "version";
    /// Service-name override installed by the versioning layer.
    pub const VERSION_SERVICE: &str = "version.service";
    /// Version suffix for the `<service>-<version>` naming convention;
    /// applied by the router once the rule's base service is known.
    pub const VERSION_SUFFIX: &str = "version.suffix";
    /// Id of the matched route, set after routing.
    pub const ROUTE_ID: &str = "route.id";
    /// Effective service name, set after routing.
    pub const ROUTE_SERVICE: &str = "route.service";
}

/// String-keyed request context with a cancellation root.
#[derive(Debug, Clone)]
pub struct RequestContext {
    values: HashMap<String, String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Creates an empty context with a fresh cancellation root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a context whose cancellation token is a child of `parent`.
    ///
    /// Adapters use this so that component shutdown cancels every in-flight
    /// request it owns.
    #[must_use]
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            values: HashMap::new(),
            cancel: parent.child_token(),
        }
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no values are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The request's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels the request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true if the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Value Tests ====================

    #[test]
    fn test_insert_and_get() {
        let mut ctx = RequestContext::new();
        assert!(ctx.is_empty());

        ctx.insert(keys::AUTH_SUBJECT, "user1");
        assert_eq!(ctx.get(keys::AUTH_SUBJECT), Some("user1"));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_insert_returns_previous() {
        let mut ctx = RequestContext::new();
        assert!(ctx.insert("k", "v1").is_none());
        assert_eq!(ctx.insert("k", "v2"), Some("v1".to_string()));
        assert_eq!(ctx.get("k"), Some("v2"));
    }

    #[test]
    fn test_remove() {
        let mut ctx = RequestContext::new();
        ctx.insert("k", "v");
        assert_eq!(ctx.remove("k"), Some("v".to_string()));
        assert!(!ctx.contains("k"));
    }

    #[test]
    fn test_get_missing() {
        let ctx = RequestContext::new();
        assert!(ctx.get("missing").is_none());
    }

    // ==================== Cancellation Tests ====================

    #[test]
    fn test_cancel() {
        let ctx = RequestContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = RequestContext::with_parent(&parent);

        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancellationToken::new();
        let ctx = RequestContext::with_parent(&parent);

        ctx.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let ctx = RequestContext::new();
        let token = ctx.cancellation().clone();
        ctx.cancel();
        token.cancelled().await;
    }
}
