//! The statistics-free and per-instance-statistic strategies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use gantry_discovery::ServiceInstance;
use parking_lot::Mutex;
use rand::Rng;

use crate::balancer::{healthy_candidates, Result};

/// How long an instance id may go unseen before its statistics age out.
const STAT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Per-instance statistic keyed by id string, with age-based garbage
/// collection so stats survive brief discovery flaps but not dead
/// instances.
#[derive(Debug)]
pub(crate) struct StatMap<T> {
    entries: HashMap<String, StatEntry<T>>,
}

#[derive(Debug)]
struct StatEntry<T> {
    value: T,
    last_seen: Instant,
}

impl<T> Default for StatMap<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> StatMap<T> {
    /// Refreshes `last_seen` for the live ids and drops entries unseen for
    /// longer than the staleness window.
    pub fn touch<'a>(&mut self, live_ids: impl Iterator<Item = &'a str>) {
        let now = Instant::now();
        for id in live_ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.last_seen = now;
            }
        }
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) <= STAT_STALE_AFTER);
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id).map(|e| &mut e.value)
    }

    pub fn entry_or(&mut self, id: &str, default: T) -> &mut T {
        &mut self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| StatEntry {
                value: default,
                last_seen: Instant::now(),
            })
            .value
    }
}

/// Atomic-counter round-robin; independent per balancer instance.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    /// Creates a fresh round-robin balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the next healthy instance in rotation.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy = healthy_candidates(instances)?;
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (counter as usize) % healthy.len();
        Ok(healthy[index].clone())
    }
}

/// Smooth weighted round-robin.
///
/// Per selection every candidate's current weight grows by its configured
/// weight; the maximum wins and is decremented by the total. This spreads a
/// weight-5 instance across the cycle instead of bursting it.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    current: Mutex<StatMap<i64>>,
}

impl WeightedRoundRobin {
    /// Creates a fresh weighted round-robin balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the instance with the highest accumulated weight.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy = healthy_candidates(instances)?;
        let total: i64 = healthy.iter().map(|i| i64::from(i.weight())).sum();

        let mut current = self.current.lock();
        current.touch(healthy.iter().map(|i| i.id.as_str()));

        let mut best: Option<&ServiceInstance> = None;
        let mut best_weight = i64::MIN;
        for instance in healthy.iter().copied() {
            let weight = current.entry_or(&instance.id, 0);
            *weight += i64::from(instance.weight());
            if *weight > best_weight {
                best_weight = *weight;
                best = Some(instance);
            }
        }

        // healthy is non-empty, so best is always set.
        let selected = best.map(|i| (*i).clone());
        if let Some(selected) = &selected {
            if let Some(weight) = current.get_mut(&selected.id) {
                *weight -= total;
            }
        }
        selected.ok_or(crate::balancer::BalanceError::NoHealthyInstances)
    }
}

/// Cumulative-weight random draw.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    /// Creates a weighted random balancer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Draws uniformly over the cumulative weights.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy = healthy_candidates(instances)?;
        let total: u64 = healthy.iter().map(|i| u64::from(i.weight())).sum();

        let mut rng = rand::thread_rng();
        let draw = rng.gen_range(0..total);

        let mut cumulative = 0u64;
        for instance in &healthy {
            cumulative += u64::from(instance.weight());
            if draw < cumulative {
                return Ok((*instance).clone());
            }
        }
        // Unreachable with positive weights; satisfy the compiler anyway.
        Ok(healthy[healthy.len() - 1].clone())
    }
}

/// Fewest in-flight requests wins; ties go to the first healthy candidate.
///
/// The counter increments at selection and decrements when the tracking
/// layer reports completion, so observed counts may race by one but settle.
#[derive(Debug, Default)]
pub struct LeastConnections {
    inflight: Mutex<StatMap<u64>>,
}

impl LeastConnections {
    /// Creates a least-connections balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the candidate with the fewest in-flight requests.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy = healthy_candidates(instances)?;

        let mut inflight = self.inflight.lock();
        inflight.touch(healthy.iter().map(|i| i.id.as_str()));

        let mut best: Option<&ServiceInstance> = None;
        let mut best_count = u64::MAX;
        for instance in healthy.iter().copied() {
            let count = inflight.get(&instance.id).copied().unwrap_or(0);
            if count < best_count {
                best_count = count;
                best = Some(instance);
            }
        }

        let selected = best.map(|i| (*i).clone());
        if let Some(selected) = &selected {
            *inflight.entry_or(&selected.id, 0) += 1;
        }
        selected.ok_or(crate::balancer::BalanceError::NoHealthyInstances)
    }

    /// Completion report from the tracking layer.
    pub fn record_result(&self, instance_id: &str, _success: bool, _latency: Duration) {
        let mut inflight = self.inflight.lock();
        if let Some(count) = inflight.get_mut(instance_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current in-flight count for an instance (observability/tests).
    #[must_use]
    pub fn inflight(&self, instance_id: &str) -> u64 {
        self.inflight.lock().get(instance_id).copied().unwrap_or(0)
    }
}

/// EWMA decay factor for new latency samples.
const EWMA_ALPHA: f64 = 0.1;
/// Score for instances without samples, permitting initial exploration.
const NEUTRAL_SCORE: f64 = 1.0;

/// Response-time balancer: highest `1000/(ewma_ms+1)` score wins.
#[derive(Debug, Default)]
pub struct ResponseTime {
    ewma: Mutex<StatMap<f64>>,
}

impl ResponseTime {
    /// Creates a response-time balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn score(ewma_ms: Option<f64>) -> f64 {
        ewma_ms.map_or(NEUTRAL_SCORE, |ms| 1000.0 / (ms + 1.0))
    }

    /// Selects the candidate with the best latency score.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy = healthy_candidates(instances)?;

        let mut ewma = self.ewma.lock();
        ewma.touch(healthy.iter().map(|i| i.id.as_str()));

        let mut best: Option<&ServiceInstance> = None;
        let mut best_score = f64::MIN;
        for instance in healthy.iter().copied() {
            let score = Self::score(ewma.get(&instance.id).copied());
            if score > best_score {
                best_score = score;
                best = Some(instance);
            }
        }

        best.map(|i| (*i).clone())
            .ok_or(crate::balancer::BalanceError::NoHealthyInstances)
    }

    /// Completion report: folds the observed latency into the EWMA.
    pub fn record_result(&self, instance_id: &str, _success: bool, latency: Duration) {
        let sample_ms = latency.as_secs_f64() * 1000.0;
        let mut ewma = self.ewma.lock();
        match ewma.get_mut(instance_id) {
            Some(value) => *value = (1.0 - EWMA_ALPHA) * *value + EWMA_ALPHA * sample_ms,
            None => {
                ewma.entry_or(instance_id, sample_ms);
            }
        }
    }

    /// The current EWMA for an instance, in milliseconds.
    #[must_use]
    pub fn ewma_ms(&self, instance_id: &str) -> Option<f64> {
        self.ewma.lock().get(instance_id).copied()
    }
}
