//! Self-tuning balancer blending three strategies.
//!
//! Holds a weight per delegate strategy (round-robin, least-connections,
//! response-time), initially one third each. Each selection draws a
//! strategy by weight; each completion is attributed to the strategy that
//! made the selection. Every 100 recorded results the weights are
//! recomputed from `0.7 * success_rate + 0.3 * latency_score` and
//! renormalized.

use std::collections::HashMap;
use std::time::Duration;

use gantry_discovery::ServiceInstance;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::balancer::Result;
use crate::basic::{LeastConnections, ResponseTime, RoundRobin};

/// Results between weight recomputations.
const RECOMPUTE_EVERY: u32 = 100;
/// Share of the score driven by success rate.
const SUCCESS_SHARE: f64 = 0.7;
/// Share of the score driven by latency.
const LATENCY_SHARE: f64 = 0.3;

const STRATEGY_COUNT: usize = 3;

#[derive(Debug, Default, Clone, Copy)]
struct StrategyStats {
    successes: u64,
    failures: u64,
    total_latency_ms: f64,
}

impl StrategyStats {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 1.0;
        }
        self.successes as f64 / total as f64
    }

    fn latency_score(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 1.0;
        }
        let avg_ms = self.total_latency_ms / total as f64;
        1000.0 / (avg_ms + 1000.0)
    }
}

#[derive(Debug)]
struct AdaptiveState {
    weights: [f64; STRATEGY_COUNT],
    stats: [StrategyStats; STRATEGY_COUNT],
    last_selected_by: HashMap<String, usize>,
    results_since_recompute: u32,
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self {
            weights: [1.0 / 3.0; STRATEGY_COUNT],
            stats: [StrategyStats::default(); STRATEGY_COUNT],
            last_selected_by: HashMap::new(),
            results_since_recompute: 0,
        }
    }
}

/// The adaptive balancer.
#[derive(Debug, Default)]
pub struct Adaptive {
    round_robin: RoundRobin,
    least_connections: LeastConnections,
    response_time: ResponseTime,
    state: Mutex<AdaptiveState>,
}

impl Adaptive {
    /// Creates an adaptive balancer with equal initial weights.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current strategy weights `[round_robin, least_connections,
    /// response_time]`.
    #[must_use]
    pub fn weights(&self) -> [f64; STRATEGY_COUNT] {
        self.state.lock().weights
    }

    fn draw_strategy(&self) -> usize {
        let weights = self.state.lock().weights;
        let mut rng = rand::thread_rng();
        let draw: f64 = rng.gen_range(0.0..1.0);

        let mut cumulative = 0.0;
        for (index, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if draw < cumulative {
                return index;
            }
        }
        STRATEGY_COUNT - 1
    }

    /// Selects via a weight-drawn delegate strategy.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let strategy = self.draw_strategy();
        let selected = match strategy {
            0 => self.round_robin.select(instances),
            1 => self.least_connections.select(instances),
            _ => self.response_time.select(instances),
        }?;

        self.state
            .lock()
            .last_selected_by
            .insert(selected.id.clone(), strategy);
        Ok(selected)
    }

    /// Completion report, attributed to the strategy that selected the
    /// instance.
    pub fn record_result(&self, instance_id: &str, success: bool, latency: Duration) {
        let strategy = {
            let mut state = self.state.lock();
            let strategy = state
                .last_selected_by
                .get(instance_id)
                .copied()
                .unwrap_or(0);

            let stats = &mut state.stats[strategy];
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            stats.total_latency_ms += latency.as_secs_f64() * 1000.0;

            state.results_since_recompute += 1;
            if state.results_since_recompute >= RECOMPUTE_EVERY {
                Self::recompute(&mut state);
            }
            strategy
        };

        // Keep the delegate's own statistics honest.
        match strategy {
            1 => self.least_connections.record_result(instance_id, success, latency),
            2 => self.response_time.record_result(instance_id, success, latency),
            _ => {}
        }
    }

    fn recompute(state: &mut AdaptiveState) {
        let mut scores = [0.0f64; STRATEGY_COUNT];
        for (index, stats) in state.stats.iter().enumerate() {
            scores[index] =
                SUCCESS_SHARE * stats.success_rate() + LATENCY_SHARE * stats.latency_score();
        }

        let total: f64 = scores.iter().sum();
        if total > 0.0 {
            for (index, score) in scores.iter().enumerate() {
                state.weights[index] = score / total;
            }
        }

        debug!(
            round_robin = state.weights[0],
            least_connections = state.weights[1],
            response_time = state.weights[2],
            "Recomputed adaptive strategy weights"
        );

        state.stats = [StrategyStats::default(); STRATEGY_COUNT];
        state.results_since_recompute = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance(id: &str) -> ServiceInstance {
        ServiceInstance::builder(id, "svc", "10.0.0.1", 8080).build()
    }

    // ==================== Initial State Tests ====================

    #[test]
    fn test_initial_weights_are_thirds() {
        let balancer = Adaptive::new();
        for weight in balancer.weights() {
            assert!((weight - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_select_returns_candidate() {
        let balancer = Adaptive::new();
        let instances = vec![make_instance("a"), make_instance("b")];

        for _ in 0..20 {
            let selected = balancer.select(&instances).ok().unwrap();
            assert!(selected.id == "a" || selected.id == "b");
        }
    }

    #[test]
    fn test_select_empty_errors() {
        let balancer = Adaptive::new();
        assert!(balancer.select(&[]).is_err());
    }

    // ==================== Recompute Tests ====================

    #[test]
    fn test_weights_stable_before_hundred_results() {
        let balancer = Adaptive::new();
        let instances = vec![make_instance("a")];

        for _ in 0..99 {
            balancer.select(&instances).ok();
            balancer.record_result("a", true, Duration::from_millis(10));
        }
        // 99 results: weights untouched.
        let weights = balancer.weights();
        assert!((weights[0] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_weights_recompute_at_hundred() {
        let balancer = Adaptive::new();
        let instances = vec![make_instance("a")];

        for _ in 0..100 {
            balancer.select(&instances).ok();
            balancer.record_result("a", true, Duration::from_millis(10));
        }

        let weights = balancer.weights();
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights must renormalize to 1");
        // All results succeeded: no strategy may collapse to zero.
        for weight in weights {
            assert!(weight > 0.0);
        }
    }

    #[test]
    fn test_failures_shift_weight_away() {
        let balancer = Adaptive::new();

        // Pin every result to strategy 0 and make it fail constantly.
        {
            let mut state = balancer.state.lock();
            state.last_selected_by.insert("a".to_string(), 0);
        }
        for _ in 0..100 {
            balancer.record_result("a", false, Duration::from_millis(10));
        }

        let weights = balancer.weights();
        assert!(
            weights[0] < weights[1],
            "failing strategy should lose weight: {weights:?}"
        );
        assert!(weights[0] < weights[2]);
    }

    #[test]
    fn test_unattributed_result_defaults_to_round_robin() {
        let balancer = Adaptive::new();
        balancer.record_result("never-selected", true, Duration::from_millis(1));
        // No panic, one result recorded.
        assert_eq!(balancer.state.lock().results_since_recompute, 1);
    }
}
