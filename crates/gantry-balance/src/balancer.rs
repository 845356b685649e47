//! The strategy tag and the sealed balancer variant set.

use std::fmt;
use std::time::Duration;

use gantry_core::GatewayRequest;
use gantry_discovery::ServiceInstance;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::adaptive::Adaptive;
use crate::basic::{
    LeastConnections, ResponseTime, RoundRobin, WeightedRandom, WeightedRoundRobin,
};
use crate::ring::ConsistentHash;
use crate::sticky::{SessionAffinityConfig, StickySession};

/// Errors that can occur during instance selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    /// The candidate list was empty.
    #[error("no instances available")]
    NoInstances,

    /// Candidates exist but none is healthy.
    #[error("no healthy instances available")]
    NoHealthyInstances,
}

/// Result type for balancer operations.
pub type Result<T> = std::result::Result<T, BalanceError>;

/// The load-balancing strategy configured on a route rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cycle through healthy instances in order.
    #[default]
    RoundRobin,
    /// Smooth weighted round-robin.
    WeightedRoundRobin,
    /// Random draw weighted by instance weight.
    WeightedRandom,
    /// Fewest in-flight requests wins.
    LeastConnections,
    /// Lowest response-time EWMA wins.
    ResponseTime,
    /// Self-tuning blend of round-robin, least-connections, and
    /// response-time.
    Adaptive,
    /// Virtual-node consistent hashing on a request key.
    ConsistentHash,
    /// Session-affinity wrapper over a fallback strategy.
    Sticky,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::WeightedRoundRobin => write!(f, "weighted_round_robin"),
            Self::WeightedRandom => write!(f, "weighted_random"),
            Self::LeastConnections => write!(f, "least_connections"),
            Self::ResponseTime => write!(f, "response_time"),
            Self::Adaptive => write!(f, "adaptive"),
            Self::ConsistentHash => write!(f, "consistent_hash"),
            Self::Sticky => write!(f, "sticky"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "weighted_random" => Ok(Self::WeightedRandom),
            "least_connections" => Ok(Self::LeastConnections),
            "response_time" => Ok(Self::ResponseTime),
            "adaptive" => Ok(Self::Adaptive),
            "consistent_hash" => Ok(Self::ConsistentHash),
            "sticky" => Ok(Self::Sticky),
            other => Err(format!("unknown load balance strategy '{other}'")),
        }
    }
}

/// One balancer instance, owned by a route rule.
///
/// Selection advances internal state (counters, weights), so two rules with
/// the same strategy are independent.
#[derive(Debug)]
pub enum Balancer {
    /// See [`RoundRobin`].
    RoundRobin(RoundRobin),
    /// See [`WeightedRoundRobin`].
    WeightedRoundRobin(WeightedRoundRobin),
    /// See [`WeightedRandom`].
    WeightedRandom(WeightedRandom),
    /// See [`LeastConnections`].
    LeastConnections(LeastConnections),
    /// See [`ResponseTime`].
    ResponseTime(ResponseTime),
    /// See [`Adaptive`].
    Adaptive(Adaptive),
    /// See [`ConsistentHash`].
    ConsistentHash(ConsistentHash),
    /// See [`StickySession`].
    Sticky(StickySession),
}

impl Balancer {
    /// Builds a balancer for the given strategy.
    ///
    /// The sticky strategy takes its affinity configuration from the rule;
    /// absent one, defaults apply.
    #[must_use]
    pub fn for_strategy(kind: StrategyKind, affinity: Option<SessionAffinityConfig>) -> Self {
        match kind {
            StrategyKind::RoundRobin => Self::RoundRobin(RoundRobin::new()),
            StrategyKind::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobin::new())
            }
            StrategyKind::WeightedRandom => Self::WeightedRandom(WeightedRandom::new()),
            StrategyKind::LeastConnections => Self::LeastConnections(LeastConnections::new()),
            StrategyKind::ResponseTime => Self::ResponseTime(ResponseTime::new()),
            StrategyKind::Adaptive => Self::Adaptive(Adaptive::new()),
            StrategyKind::ConsistentHash => Self::ConsistentHash(ConsistentHash::new()),
            StrategyKind::Sticky => Self::Sticky(StickySession::new(
                affinity.unwrap_or_default(),
                Box::new(Self::RoundRobin(RoundRobin::new())),
            )),
        }
    }

    /// The strategy this balancer implements.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::RoundRobin(_) => StrategyKind::RoundRobin,
            Self::WeightedRoundRobin(_) => StrategyKind::WeightedRoundRobin,
            Self::WeightedRandom(_) => StrategyKind::WeightedRandom,
            Self::LeastConnections(_) => StrategyKind::LeastConnections,
            Self::ResponseTime(_) => StrategyKind::ResponseTime,
            Self::Adaptive(_) => StrategyKind::Adaptive,
            Self::ConsistentHash(_) => StrategyKind::ConsistentHash,
            Self::Sticky(_) => StrategyKind::Sticky,
        }
    }

    /// True when `select_for_request` uses the request itself.
    #[must_use]
    pub fn is_request_aware(&self) -> bool {
        matches!(self, Self::ConsistentHash(_) | Self::Sticky(_))
    }

    /// Selects one instance from the candidates.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        match self {
            Self::RoundRobin(b) => b.select(instances),
            Self::WeightedRoundRobin(b) => b.select(instances),
            Self::WeightedRandom(b) => b.select(instances),
            Self::LeastConnections(b) => b.select(instances),
            Self::ResponseTime(b) => b.select(instances),
            Self::Adaptive(b) => b.select(instances),
            Self::ConsistentHash(b) => b.select(instances),
            Self::Sticky(b) => b.select(instances),
        }
    }

    /// Selects one instance, giving request-aware strategies the request.
    ///
    /// Strategies without request context fall back to [`Balancer::select`].
    pub fn select_for_request(
        &self,
        request: &GatewayRequest,
        instances: &[ServiceInstance],
    ) -> Result<ServiceInstance> {
        match self {
            Self::ConsistentHash(b) => b.select_for_request(request, instances),
            Self::Sticky(b) => b.select_for_request(request, instances),
            other => other.select(instances),
        }
    }

    /// Reports the outcome of a proxied request for the selected instance.
    ///
    /// Feeds in-flight counters, latency EWMAs, and adaptive weights; the
    /// tracking layer calls this once per completed request.
    pub fn record_result(&self, instance_id: &str, success: bool, latency: Duration) {
        match self {
            Self::LeastConnections(b) => b.record_result(instance_id, success, latency),
            Self::ResponseTime(b) => b.record_result(instance_id, success, latency),
            Self::Adaptive(b) => b.record_result(instance_id, success, latency),
            Self::Sticky(b) => b.record_result(instance_id, success, latency),
            _ => {}
        }
    }

    /// Spawns background maintenance (the sticky store sweep) onto the
    /// current runtime, bound to `stop`. No-op for other strategies or
    /// outside a runtime.
    pub fn spawn_maintenance(&self, stop: &CancellationToken) {
        if let Self::Sticky(b) = self {
            b.spawn_sweeper(stop);
        }
    }
}

/// Filters candidates down to healthy ones, distinguishing the two failure
/// modes.
pub(crate) fn healthy_candidates(
    instances: &[ServiceInstance],
) -> Result<Vec<&ServiceInstance>> {
    if instances.is_empty() {
        return Err(BalanceError::NoInstances);
    }
    let healthy: Vec<&ServiceInstance> = instances.iter().filter(|i| i.healthy).collect();
    if healthy.is_empty() {
        return Err(BalanceError::NoHealthyInstances);
    }
    Ok(healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance(id: &str) -> ServiceInstance {
        ServiceInstance::builder(id, "svc", "10.0.0.1", 8080).build()
    }

    // ==================== StrategyKind Tests ====================

    #[test]
    fn test_strategy_kind_display_round_trip() {
        let kinds = [
            StrategyKind::RoundRobin,
            StrategyKind::WeightedRoundRobin,
            StrategyKind::WeightedRandom,
            StrategyKind::LeastConnections,
            StrategyKind::ResponseTime,
            StrategyKind::Adaptive,
            StrategyKind::ConsistentHash,
            StrategyKind::Sticky,
        ];
        for kind in kinds {
            let parsed: StrategyKind = kind.to_string().parse().ok().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_strategy_kind_from_str_unknown() {
        let parsed: std::result::Result<StrategyKind, _> = "fastest".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn test_strategy_kind_serde() {
        let json = serde_json::to_string(&StrategyKind::ConsistentHash).ok();
        assert_eq!(json.as_deref(), Some("\"consistent_hash\""));
    }

    #[test]
    fn test_strategy_kind_default() {
        assert_eq!(StrategyKind::default(), StrategyKind::RoundRobin);
    }

    // ==================== Factory Tests ====================

    #[test]
    fn test_for_strategy_builds_matching_variant() {
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::WeightedRoundRobin,
            StrategyKind::WeightedRandom,
            StrategyKind::LeastConnections,
            StrategyKind::ResponseTime,
            StrategyKind::Adaptive,
            StrategyKind::ConsistentHash,
            StrategyKind::Sticky,
        ] {
            let balancer = Balancer::for_strategy(kind, None);
            assert_eq!(balancer.kind(), kind);
        }
    }

    #[test]
    fn test_request_awareness() {
        assert!(Balancer::for_strategy(StrategyKind::ConsistentHash, None).is_request_aware());
        assert!(Balancer::for_strategy(StrategyKind::Sticky, None).is_request_aware());
        assert!(!Balancer::for_strategy(StrategyKind::RoundRobin, None).is_request_aware());
        assert!(!Balancer::for_strategy(StrategyKind::Adaptive, None).is_request_aware());
    }

    // ==================== Candidate Filter Tests ====================

    #[test]
    fn test_healthy_candidates_empty() {
        let result = healthy_candidates(&[]);
        assert_eq!(result.err(), Some(BalanceError::NoInstances));
    }

    #[test]
    fn test_healthy_candidates_all_unhealthy() {
        let mut instance = make_instance("a");
        instance.healthy = false;
        let instances = [instance];
        let result = healthy_candidates(&instances);
        assert_eq!(result.err(), Some(BalanceError::NoHealthyInstances));
    }

    #[test]
    fn test_healthy_candidates_filters() {
        let healthy = make_instance("a");
        let mut unhealthy = make_instance("b");
        unhealthy.healthy = false;

        let instances = vec![healthy, unhealthy];
        let candidates = healthy_candidates(&instances).ok().unwrap_or_default();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "a");
    }
}
