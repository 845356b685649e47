//! The router: resolves `(method, path)` to a backend instance.

use std::collections::HashMap;
use std::sync::Arc;

use gantry_core::context::keys;
use gantry_core::{ErrorKind, GatewayError, GatewayRequest};
use gantry_discovery::{DiscoveryError, Registry, ServiceInstance};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pattern::MatchTree;
use crate::rule::RouteRule;

/// Errors that can occur while routing.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No rule matched the request path (or the matched rule rejected the
    /// method; both surface as not-found).
    #[error("no route matched path '{0}'")]
    NoRouteMatched(String),

    /// The selected service is unknown to the registry.
    #[error("service '{0}' not found")]
    UnknownService(String),

    /// The selected service has no healthy instance.
    #[error("service '{0}' has no healthy instances")]
    NoHealthyInstance(String),

    /// A rule with this id is already registered.
    #[error("duplicate rule id '{0}'")]
    DuplicateRule(String),

    /// The rule id is not registered.
    #[error("rule '{0}' not found")]
    RuleNotFound(String),

    /// The pattern failed to compile.
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<RoutingError> for GatewayError {
    fn from(err: RoutingError) -> Self {
        match &err {
            RoutingError::NoRouteMatched(path) => {
                GatewayError::not_found("no route matched").with_detail("path", path.clone())
            }
            RoutingError::UnknownService(service) => GatewayError::not_found("unknown service")
                .with_detail("service", service.clone()),
            RoutingError::NoHealthyInstance(service) => {
                GatewayError::unavailable("no healthy instance")
                    .with_detail("service", service.clone())
            }
            RoutingError::DuplicateRule(_)
            | RoutingError::RuleNotFound(_)
            | RoutingError::InvalidPattern { .. } => {
                GatewayError::new(ErrorKind::Internal, err.to_string())
            }
        }
    }
}

/// A successful routing decision, ephemeral per request.
#[derive(Debug)]
pub struct RouteResult {
    /// The selected backend instance.
    pub instance: ServiceInstance,
    /// The matched rule.
    pub rule: Arc<RouteRule>,
    /// Effective service name (after any version override).
    pub service_name: String,
    /// Captured path parameters.
    pub params: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct RouterInner {
    rules: HashMap<String, Arc<RouteRule>>,
    order: HashMap<String, u64>,
    tree: MatchTree,
    next_order: u64,
}

impl RouterInner {
    fn rebuild_tree(&mut self) {
        let mut tree = MatchTree::new();
        for (id, rule) in &self.rules {
            let order = self.order.get(id).copied().unwrap_or(u64::MAX);
            tree.insert(&rule.pattern, order, id);
        }
        self.tree = tree;
    }
}

/// The routing table plus instance selection.
///
/// Reads are cheap (shared lock over the compiled tree); writes
/// (registration, removal) rebuild the tree.
#[derive(Debug)]
pub struct Router {
    registry: Arc<dyn Registry>,
    inner: RwLock<RouterInner>,
    stop: CancellationToken,
}

impl Router {
    /// Creates a router over a registry.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            inner: RwLock::new(RouterInner::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Registers a rule.
    ///
    /// # Errors
    ///
    /// Rejects duplicate rule ids.
    pub fn add_rule(&self, rule: RouteRule) -> Result<(), RoutingError> {
        let mut inner = self.inner.write();
        if inner.rules.contains_key(&rule.id) {
            return Err(RoutingError::DuplicateRule(rule.id));
        }

        rule.balancer.spawn_maintenance(&self.stop);

        let order = inner.next_order;
        inner.next_order += 1;

        info!(rule = %rule, "Registered route");
        let id = rule.id.clone();
        inner.tree.insert(&rule.pattern, order, &id);
        inner.order.insert(id.clone(), order);
        inner.rules.insert(id, Arc::new(rule));
        Ok(())
    }

    /// Removes a rule by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is unknown.
    pub fn remove_rule(&self, id: &str) -> Result<(), RoutingError> {
        let mut inner = self.inner.write();
        if inner.rules.remove(id).is_none() {
            return Err(RoutingError::RuleNotFound(id.to_string()));
        }
        inner.order.remove(id);
        inner.rebuild_tree();
        info!(rule = id, "Removed route");
        Ok(())
    }

    /// Returns a rule by id.
    #[must_use]
    pub fn rule(&self, id: &str) -> Option<Arc<RouteRule>> {
        self.inner.read().rules.get(id).cloned()
    }

    /// Lists registered rule ids in registration order.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut ids: Vec<(u64, String)> = inner
            .order
            .iter()
            .map(|(id, order)| (*order, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().rules.len()
    }

    /// True when no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().rules.is_empty()
    }

    /// The registry this router selects instances from.
    #[must_use]
    pub fn registry(&self) -> Arc<dyn Registry> {
        Arc::clone(&self.registry)
    }

    /// Stops balancer maintenance tasks.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves a request to `(instance, rule, service)`.
    ///
    /// Pure-read over the table, but advances the matched rule's balancer
    /// state. A method mismatch on the matched pattern surfaces as
    /// [`RoutingError::NoRouteMatched`], preserving the observed behavior
    /// of the original gateway.
    pub fn route(&self, request: &GatewayRequest) -> Result<RouteResult, RoutingError> {
        let (rule, params) = {
            let inner = self.inner.read();
            let hit = inner
                .tree
                .find(&request.path)
                .ok_or_else(|| RoutingError::NoRouteMatched(request.path.clone()))?;

            let rule = hit
                .rule_ids
                .iter()
                .filter_map(|id| inner.rules.get(id))
                .find(|rule| rule.accepts_method(&request.method))
                .cloned()
                .ok_or_else(|| RoutingError::NoRouteMatched(request.path.clone()))?;

            let params = rule.pattern.matches(&request.path).unwrap_or_default();
            (rule, params)
        };

        // A versioning layer upstream may override the backend service,
        // either outright or via the `<service>-<version>` convention.
        let service_name = match (
            request.context.get(keys::VERSION_SERVICE),
            request.context.get(keys::VERSION_SUFFIX),
        ) {
            (Some(service), _) => service.to_string(),
            (None, Some(suffix)) => format!("{}-{suffix}", rule.service_name),
            (None, None) => rule.service_name.clone(),
        };

        let candidates = self.registry.get_service(&service_name).map_err(|e| match e {
            DiscoveryError::ServiceNotFound(name) => RoutingError::UnknownService(name),
            DiscoveryError::NoHealthyInstance(name) => RoutingError::NoHealthyInstance(name),
            other => RoutingError::UnknownService(other.to_string()),
        })?;

        let instance = if rule.balancer.is_request_aware() {
            rule.balancer.select_for_request(request, &candidates)
        } else {
            rule.balancer.select(&candidates)
        }
        .map_err(|_| RoutingError::NoHealthyInstance(service_name.clone()))?;

        debug!(
            rule = %rule.id,
            service = %service_name,
            instance = %instance.id,
            "Routed request"
        );

        Ok(RouteResult {
            instance,
            rule,
            service_name,
            params,
        })
    }
}
