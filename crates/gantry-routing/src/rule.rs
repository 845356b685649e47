//! Route rules: one pattern + method set + service binding + balancer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use gantry_balance::{Balancer, SessionAffinityConfig, StrategyKind};
use http::Method;
use serde::{Deserialize, Serialize};

use crate::pattern::Pattern;
use crate::router::RoutingError;

/// Protocol shape expected at the front end for this rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolHint {
    /// Inferred from the request.
    #[default]
    Auto,
    /// Plain request/response HTTP.
    Http,
    /// Server-sent events.
    Sse,
    /// WebSocket upgrade.
    Websocket,
    /// gRPC passthrough.
    Grpc,
}

/// One routing entry, owned by the router.
///
/// The balancer is owned here: selection state (counters, rings, session
/// stores) is per rule, never shared between rules.
#[derive(Debug)]
pub struct RouteRule {
    /// Unique rule id; dynamic sources prefix it with `<source>:`.
    pub id: String,
    /// Compiled path pattern.
    pub pattern: Pattern,
    /// Accepted methods; empty means any.
    pub methods: HashSet<Method>,
    /// Backend service name.
    pub service_name: String,
    /// Strategy tag the balancer was built from.
    pub load_balance: StrategyKind,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
    /// Sticky-session configuration, when the strategy uses it.
    pub session_affinity: Option<SessionAffinityConfig>,
    /// Protocol expectation.
    pub protocol: ProtocolHint,
    /// Free-form metadata (descriptor extensions land here).
    pub metadata: HashMap<String, String>,
    /// The owned balancer.
    pub balancer: Balancer,
}

impl RouteRule {
    /// Starts building a rule.
    #[must_use]
    pub fn builder(
        id: impl Into<String>,
        path: impl Into<String>,
        service_name: impl Into<String>,
    ) -> RouteRuleBuilder {
        RouteRuleBuilder::new(id, path, service_name)
    }

    /// True when the rule accepts the method (empty set accepts any).
    #[must_use]
    pub fn accepts_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({})",
            self.id, self.pattern, self.service_name, self.load_balance
        )
    }
}

/// Builder for [`RouteRule`].
#[derive(Debug)]
pub struct RouteRuleBuilder {
    id: String,
    path: String,
    service_name: String,
    methods: HashSet<Method>,
    load_balance: StrategyKind,
    timeout: Option<Duration>,
    session_affinity: Option<SessionAffinityConfig>,
    protocol: ProtocolHint,
    metadata: HashMap<String, String>,
}

impl RouteRuleBuilder {
    fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            service_name: service_name.into(),
            methods: HashSet::new(),
            load_balance: StrategyKind::default(),
            timeout: None,
            session_affinity: None,
            protocol: ProtocolHint::default(),
            metadata: HashMap::new(),
        }
    }

    /// Adds an accepted method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.methods.insert(method);
        self
    }

    /// Adds accepted methods from name strings; invalid names are dropped.
    #[must_use]
    pub fn methods(mut self, names: &[&str]) -> Self {
        for name in names {
            if let Ok(method) = Method::from_bytes(name.to_uppercase().as_bytes()) {
                self.methods.insert(method);
            }
        }
        self
    }

    /// Sets the load-balance strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.load_balance = strategy;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the session-affinity configuration (implies the sticky
    /// strategy honors it).
    #[must_use]
    pub fn session_affinity(mut self, config: SessionAffinityConfig) -> Self {
        self.session_affinity = Some(config);
        self
    }

    /// Sets the protocol hint.
    #[must_use]
    pub fn protocol(mut self, protocol: ProtocolHint) -> Self {
        self.protocol = protocol;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Compiles the pattern and builds the rule with its balancer.
    pub fn build(self) -> Result<RouteRule, RoutingError> {
        let pattern = Pattern::compile(&self.path)?;
        let balancer =
            Balancer::for_strategy(self.load_balance, self.session_affinity.clone());

        Ok(RouteRule {
            id: self.id,
            pattern,
            methods: self.methods,
            service_name: self.service_name,
            load_balance: self.load_balance,
            timeout: self.timeout,
            session_affinity: self.session_affinity,
            protocol: self.protocol,
            metadata: self.metadata,
            balancer,
        })
    }
}

/// Serializable rule description used by configuration files and dynamic
/// descriptor sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Rule id.
    pub id: String,
    /// Path pattern.
    pub path: String,
    /// Accepted method names; empty means any.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Backend service name.
    pub service_name: String,
    /// Load-balance strategy.
    #[serde(default)]
    pub load_balance: StrategyKind,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Sticky-session configuration.
    #[serde(default)]
    pub session_affinity: Option<SessionAffinityConfig>,
    /// Protocol hint.
    #[serde(default)]
    pub protocol: ProtocolHint,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RuleSpec {
    /// Builds the runtime rule.
    pub fn into_rule(self) -> Result<RouteRule, RoutingError> {
        let mut builder = RouteRule::builder(self.id, self.path, self.service_name)
            .strategy(self.load_balance)
            .protocol(self.protocol);

        let method_names: Vec<&str> = self.methods.iter().map(String::as_str).collect();
        builder = builder.methods(&method_names);

        if let Some(secs) = self.timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(affinity) = self.session_affinity {
            builder = builder.session_affinity(affinity);
        }
        for (key, value) in self.metadata {
            builder = builder.metadata(key, value);
        }
        builder.build()
    }
}
