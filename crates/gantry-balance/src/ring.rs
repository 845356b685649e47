//! Virtual-node consistent hashing.
//!
//! Every candidate instance, healthy or not, is placed on a 32-bit ring
//! `replicas` times (default 150) by hashing `<instance_id>#<replica_index>`;
//! hash collisions append a `~<n>` suffix until the slot is free. The
//! affinity key is drawn from the request in priority order: `X-Session-Id`
//! header, `session` cookie, client IP, path. Lookup walks clockwise from
//! the key's position to the first healthy instance, so a key whose owner
//! is down lands on the next node and returns home once the owner recovers.
//! The ring is rebuilt only when the candidate set or its health flags
//! change.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use gantry_core::GatewayRequest;
use gantry_discovery::ServiceInstance;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::balancer::{healthy_candidates, BalanceError, Result};

/// Default virtual nodes per instance.
pub const DEFAULT_REPLICAS: usize = 150;

fn hash_u32(value: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() & 0xFFFF_FFFF) as u32
}

#[derive(Debug, Default)]
struct RingState {
    /// Sorted (hash, instance id) pairs.
    entries: Vec<(u32, String)>,
    /// Identity of the candidate set the ring was built from.
    fingerprint: u64,
}

/// The consistent-hash balancer.
#[derive(Debug)]
pub struct ConsistentHash {
    replicas: usize,
    ring: Mutex<RingState>,
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistentHash {
    /// Creates a balancer with the default replica count.
    #[must_use]
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    /// Creates a balancer with an explicit replica count.
    #[must_use]
    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: Mutex::new(RingState::default()),
        }
    }

    /// Extracts the affinity key from the request.
    #[must_use]
    pub fn affinity_key(request: &GatewayRequest) -> String {
        if let Some(session) = request.header("x-session-id") {
            return session.to_string();
        }
        if let Some(session) = request.cookie("session") {
            return session;
        }
        let ip = request.client_ip();
        if !ip.is_unspecified() {
            return ip.to_string();
        }
        request.path.clone()
    }

    fn fingerprint(instances: &[ServiceInstance]) -> u64 {
        let mut keys: Vec<(String, bool)> = instances
            .iter()
            .map(|i| (i.id.clone(), i.healthy))
            .collect();
        keys.sort();
        let mut hasher = DefaultHasher::new();
        keys.hash(&mut hasher);
        hasher.finish()
    }

    fn rebuild(&self, state: &mut RingState, instances: &[ServiceInstance]) {
        let mut slots: HashMap<u32, String> = HashMap::new();
        for instance in instances {
            for replica in 0..self.replicas {
                let mut key = format!("{}#{replica}", instance.id);
                let mut hash = hash_u32(&key);
                let mut bump = 0u32;
                while slots.contains_key(&hash) {
                    bump += 1;
                    key = format!("{}#{replica}~{bump}", instance.id);
                    hash = hash_u32(&key);
                }
                slots.insert(hash, instance.id.clone());
            }
        }

        let mut entries: Vec<(u32, String)> = slots.into_iter().collect();
        entries.sort_by_key(|(hash, _)| *hash);
        state.entries = entries;
        state.fingerprint = Self::fingerprint(instances);

        debug!(
            instances = instances.len(),
            virtual_nodes = state.entries.len(),
            "Rebuilt consistent-hash ring"
        );
    }

    /// Looks up the instance owning `key`, walking clockwise past
    /// unhealthy candidates.
    fn lookup(
        entries: &[(u32, String)],
        by_id: &HashMap<&str, &ServiceInstance>,
        key: &str,
    ) -> Option<ServiceInstance> {
        if entries.is_empty() {
            return None;
        }
        let key_hash = hash_u32(key);
        let start = entries.partition_point(|(hash, _)| *hash < key_hash) % entries.len();

        for offset in 0..entries.len() {
            let (_, id) = &entries[(start + offset) % entries.len()];
            if let Some(instance) = by_id.get(id.as_str()) {
                if instance.healthy {
                    return Some((*instance).clone());
                }
            }
        }
        None
    }

    /// Selects by the request's affinity key.
    pub fn select_for_request(
        &self,
        request: &GatewayRequest,
        instances: &[ServiceInstance],
    ) -> Result<ServiceInstance> {
        if instances.is_empty() {
            return Err(BalanceError::NoInstances);
        }
        let key = Self::affinity_key(request);

        let by_id: HashMap<&str, &ServiceInstance> =
            instances.iter().map(|i| (i.id.as_str(), i)).collect();

        let mut ring = self.ring.lock();
        if ring.fingerprint != Self::fingerprint(instances) {
            self.rebuild(&mut ring, instances);
        }

        Self::lookup(&ring.entries, &by_id, &key).ok_or(BalanceError::NoHealthyInstances)
    }

    /// Without a request there is no key; fall back to a uniform draw.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let healthy = healthy_candidates(instances)?;
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..healthy.len());
        Ok(healthy[index].clone())
    }
}
