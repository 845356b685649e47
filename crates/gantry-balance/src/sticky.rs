//! Sticky-session balancing: pin a session key to one instance.
//!
//! Wraps a fallback balancer. The session key is extracted per the rule's
//! [`SessionAffinityConfig`]; a known key returns its recorded instance as
//! long as that instance is still present and healthy, otherwise the
//! fallback selects and the new pairing is recorded.
//!
//! The default in-memory store is bounded: LRU eviction past `max_entries`,
//! TTL expiry purged lazily on access and by a background sweep.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_core::GatewayRequest;
use gantry_discovery::ServiceInstance;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::balancer::{Balancer, Result};

/// Where the session key is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AffinitySource {
    /// A cookie (default `GATEWAY_SESSION`).
    #[default]
    Cookie,
    /// A header (default `X-Session-Id`).
    Header,
    /// A query parameter (default `session`).
    Query,
}

/// Session affinity configuration carried by a route rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAffinityConfig {
    /// Whether affinity is active; disabled falls straight to the fallback.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Entry time-to-live.
    #[serde(default = "default_ttl", with = "duration_secs")]
    pub ttl: Duration,
    /// Key source.
    #[serde(default)]
    pub source: AffinitySource,
    /// Cookie name for [`AffinitySource::Cookie`].
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Header name for [`AffinitySource::Header`].
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Query parameter for [`AffinitySource::Query`].
    #[serde(default = "default_query_param")]
    pub query_param: String,
    /// Store capacity; LRU eviction past this.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_cookie_name() -> String {
    "GATEWAY_SESSION".to_string()
}

fn default_header_name() -> String {
    "X-Session-Id".to_string()
}

fn default_query_param() -> String {
    "session".to_string()
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for SessionAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl: default_ttl(),
            source: AffinitySource::default(),
            cookie_name: default_cookie_name(),
            header_name: default_header_name(),
            query_param: default_query_param(),
            max_entries: default_max_entries(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// The session-to-instance mapping store.
///
/// External stores may replace the in-memory default; the contract is a
/// plain key/value view with expiry handled by the implementation.
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Returns the recorded instance id for `key`, refreshing recency.
    fn get(&self, key: &str) -> Option<String>;

    /// Records a pairing.
    fn insert(&self, key: &str, instance_id: &str);

    /// Drops a pairing.
    fn remove(&self, key: &str);

    /// Number of live entries.
    fn len(&self) -> usize;

    /// True when no entries are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries.
    fn purge_expired(&self);
}

#[derive(Debug)]
struct SessionEntry {
    instance_id: String,
    last_access: Instant,
}

/// Bounded in-memory [`SessionStore`] with TTL expiry and LRU eviction.
#[derive(Debug)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, SessionEntry>>,
    max_entries: usize,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Creates a store with the given bounds.
    #[must_use]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let expired = entries
            .get(key)
            .is_some_and(|e| e.last_access.elapsed() > self.ttl);
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key).map(|entry| {
            entry.last_access = Instant::now();
            entry.instance_id.clone()
        })
    }

    fn insert(&self, key: &str, instance_id: &str) {
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            // Evict the least recently used entry.
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            SessionEntry {
                instance_id: instance_id.to_string(),
                last_access: Instant::now(),
            },
        );
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn purge_expired(&self) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_access.elapsed() <= self.ttl);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired session entries");
        }
    }
}

/// The sticky-session balancer.
#[derive(Debug)]
pub struct StickySession {
    config: SessionAffinityConfig,
    store: Arc<dyn SessionStore>,
    fallback: Box<Balancer>,
}

impl StickySession {
    /// Creates a sticky balancer with the in-memory store.
    #[must_use]
    pub fn new(config: SessionAffinityConfig, fallback: Box<Balancer>) -> Self {
        let store = Arc::new(MemorySessionStore::new(config.max_entries, config.ttl));
        Self {
            config,
            store,
            fallback,
        }
    }

    /// Creates a sticky balancer over an external store.
    #[must_use]
    pub fn with_store(
        config: SessionAffinityConfig,
        store: Arc<dyn SessionStore>,
        fallback: Box<Balancer>,
    ) -> Self {
        Self {
            config,
            store,
            fallback,
        }
    }

    /// Extracts the session key per the configured source.
    #[must_use]
    pub fn session_key(&self, request: &GatewayRequest) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        match self.config.source {
            AffinitySource::Cookie => request.cookie(&self.config.cookie_name),
            AffinitySource::Header => request
                .header(&self.config.header_name)
                .map(ToString::to_string),
            AffinitySource::Query => request.query_param(&self.config.query_param),
        }
    }

    /// Selects with affinity: recorded instance if present and healthy,
    /// else the fallback (recording the new pairing).
    pub fn select_for_request(
        &self,
        request: &GatewayRequest,
        instances: &[ServiceInstance],
    ) -> Result<ServiceInstance> {
        let Some(key) = self.session_key(request) else {
            return self.fallback.select_for_request(request, instances);
        };

        if let Some(recorded) = self.store.get(&key) {
            if let Some(instance) = instances
                .iter()
                .find(|i| i.id == recorded && i.healthy)
            {
                return Ok(instance.clone());
            }
            self.store.remove(&key);
        }

        let selected = self.fallback.select_for_request(request, instances)?;
        self.store.insert(&key, &selected.id);
        Ok(selected)
    }

    /// Keyless selection delegates to the fallback.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        self.fallback.select(instances)
    }

    /// Forwards completion statistics to the fallback.
    pub fn record_result(&self, instance_id: &str, success: bool, latency: Duration) {
        self.fallback.record_result(instance_id, success, latency);
    }

    /// Number of recorded sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    /// Spawns the periodic expiry sweep bound to `stop`. Outside a tokio
    /// runtime this is a no-op; lazy purging still bounds staleness.
    pub fn spawn_sweeper(&self, stop: &CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let stop = stop.clone();
        let period = (self.config.ttl / 2).max(Duration::from_secs(1));

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => store.purge_expired(),
                }
            }
        });
    }
}
