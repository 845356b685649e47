//! The registry contract and the snapshot-swapping shared registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::ServiceInstance;

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The service name is not known to the registry.
    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    /// The service is known but has no healthy instance.
    #[error("service '{0}' has no healthy instances")]
    NoHealthyInstance(String),

    /// The discovery source failed.
    #[error("discovery source error: {0}")]
    Source(String),

    /// A discovered payload could not be parsed.
    #[error("failed to parse discovery data: {0}")]
    Parse(String),

    /// I/O failure while reading discovery inputs.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// The full discovered state: service name to its instances.
pub type ServiceMap = HashMap<String, Vec<ServiceInstance>>;

/// Read-side contract the router depends on.
///
/// `get_service` filters to healthy instances and distinguishes "no such
/// service" from "no healthy instance"; `all_instances` is the unfiltered
/// view the health monitor polls.
pub trait Registry: Send + Sync + fmt::Debug {
    /// Returns the healthy instances of `name`.
    fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// Returns every known instance of `name`, healthy or not.
    fn all_instances(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// Returns the currently known service names.
    fn service_names(&self) -> Vec<String>;

    /// Updates the health flag of one instance.
    fn mark_health(&self, service: &str, instance_id: &str, healthy: bool);
}

/// A source of discovered instances (static list, Docker, Compose,
/// Kubernetes).
#[async_trait]
pub trait DiscoverySource: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Produces a complete view of the source's services.
    async fn discover(&self) -> Result<ServiceMap>;
}

type HealthCallback = Box<dyn Fn(&str, &ServiceInstance, bool) + Send + Sync>;

/// Registry over a single [`DiscoverySource`] with periodic refresh.
///
/// Each refresh builds a complete map and swaps it atomically; readers see
/// either the full pre-refresh or post-refresh state. A failed refresh keeps
/// the last good snapshot. Health flags written via [`Registry::mark_health`]
/// survive refreshes for instances that are still discovered.
pub struct SharedRegistry {
    source: Box<dyn DiscoverySource>,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<ServiceMap>>,
    callbacks: RwLock<Vec<HealthCallback>>,
    stop: CancellationToken,
}

impl fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("source", &self.source.name())
            .field("services", &self.snapshot.read().len())
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl SharedRegistry {
    /// Creates a registry over `source` with the default 30 s refresh.
    #[must_use]
    pub fn new(source: Box<dyn DiscoverySource>) -> Self {
        Self {
            source,
            refresh_interval: Duration::from_secs(30),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            callbacks: RwLock::new(Vec::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Sets the refresh interval.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Registers a callback invoked whenever an instance's health flips.
    pub fn on_health_change(
        &self,
        callback: impl Fn(&str, &ServiceInstance, bool) + Send + Sync + 'static,
    ) {
        self.callbacks.write().push(Box::new(callback));
    }

    /// The current snapshot; cheap to clone, never mutated in place.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ServiceMap> {
        Arc::clone(&self.snapshot.read())
    }

    /// Discovers the current state and swaps the snapshot.
    ///
    /// Health flags previously written through [`Registry::mark_health`] are
    /// carried forward for instances that are still present, so a refresh
    /// never resurrects an instance the monitor marked down.
    pub async fn refresh(&self) -> Result<()> {
        let mut discovered = self.source.discover().await?;
        let previous = self.snapshot();

        for (service, instances) in &mut discovered {
            if let Some(old) = previous.get(service) {
                for instance in instances.iter_mut() {
                    if let Some(prior) = old.iter().find(|o| o.id == instance.id) {
                        instance.healthy = prior.healthy;
                    }
                }
            }
        }

        let services = discovered.len();
        let instances: usize = discovered.values().map(Vec::len).sum();
        *self.snapshot.write() = Arc::new(discovered);

        debug!(
            source = self.source.name(),
            services, instances, "Refreshed registry snapshot"
        );
        Ok(())
    }

    /// Performs the initial synchronous refresh and spawns the refresh loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial refresh fails; the gateway should not
    /// come up without a meaningful first snapshot.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.refresh().await?;
        info!(
            source = self.source.name(),
            services = self.snapshot().len(),
            "Registry started"
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = registry.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.refresh().await {
                            warn!(
                                source = registry.source.name(),
                                error = %e,
                                "Refresh failed, keeping last known snapshot"
                            );
                        }
                    }
                }
            }
            debug!(source = registry.source.name(), "Registry refresh loop stopped");
        });
        Ok(())
    }

    /// Stops the refresh loop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn fire_callbacks(&self, service: &str, instance: &ServiceInstance, healthy: bool) {
        for callback in self.callbacks.read().iter() {
            callback(service, instance, healthy);
        }
    }
}

impl Registry for SharedRegistry {
    fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let snapshot = self.snapshot();
        let instances = snapshot
            .get(name)
            .ok_or_else(|| DiscoveryError::ServiceNotFound(name.to_string()))?;

        let healthy: Vec<ServiceInstance> =
            instances.iter().filter(|i| i.healthy).cloned().collect();

        if healthy.is_empty() {
            return Err(DiscoveryError::NoHealthyInstance(name.to_string()));
        }
        Ok(healthy)
    }

    fn all_instances(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let snapshot = self.snapshot();
        snapshot
            .get(name)
            .cloned()
            .ok_or_else(|| DiscoveryError::ServiceNotFound(name.to_string()))
    }

    fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    fn mark_health(&self, service: &str, instance_id: &str, healthy: bool) {
        let changed = {
            let mut guard = self.snapshot.write();
            let mut map = (**guard).clone();
            let mut changed = None;

            if let Some(instances) = map.get_mut(service) {
                if let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) {
                    if instance.healthy != healthy {
                        instance.healthy = healthy;
                        changed = Some(instance.clone());
                    }
                }
            }

            if changed.is_some() {
                *guard = Arc::new(map);
            }
            changed
        };

        if let Some(instance) = changed {
            info!(
                service,
                instance = %instance.id,
                healthy,
                "Instance health changed"
            );
            self.fire_callbacks(service, &instance, healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ==================== Test Source ====================

    #[derive(Debug, Clone)]
    struct TestSource {
        maps: Arc<Mutex<Vec<ServiceMap>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl TestSource {
        fn new(map: ServiceMap) -> Self {
            Self {
                maps: Arc::new(Mutex::new(vec![map])),
                fail: Arc::new(Mutex::new(false)),
            }
        }

        fn push(&self, map: ServiceMap) {
            self.maps.lock().push(map);
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock() = fail;
        }
    }

    #[async_trait]
    impl DiscoverySource for TestSource {
        fn name(&self) -> &str {
            "test"
        }

        async fn discover(&self) -> Result<ServiceMap> {
            if *self.fail.lock() {
                return Err(DiscoveryError::Source("injected failure".to_string()));
            }
            let mut maps = self.maps.lock();
            if maps.len() > 1 {
                Ok(maps.remove(0))
            } else {
                Ok(maps[0].clone())
            }
        }
    }

    fn make_instance(id: &str, name: &str, healthy: bool) -> ServiceInstance {
        ServiceInstance::builder(id, name, "10.0.0.1", 8080)
            .healthy(healthy)
            .build()
    }

    fn one_service_map(name: &str, instances: Vec<ServiceInstance>) -> ServiceMap {
        let mut map = HashMap::new();
        map.insert(name.to_string(), instances);
        map
    }

    // ==================== Refresh Tests ====================

    #[tokio::test]
    async fn test_refresh_populates_snapshot() {
        let map = one_service_map("svc", vec![make_instance("a", "svc", true)]);
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));

        registry.refresh().await.ok();

        let instances = registry.get_service("svc").ok().unwrap_or_default();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "a");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let source = TestSource::new(one_service_map("svc", vec![make_instance("a", "svc", true)]));
        let handle = source.clone();
        let registry = SharedRegistry::new(Box::new(source));

        registry.refresh().await.ok();

        handle.set_fail(true);
        assert!(registry.refresh().await.is_err());

        // Last known good state is retained.
        let instances = registry.get_service("svc").ok().unwrap_or_default();
        assert_eq!(instances.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_carries_forward_marked_health() {
        let map = one_service_map(
            "svc",
            vec![make_instance("a", "svc", true), make_instance("b", "svc", true)],
        );
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));

        registry.refresh().await.ok();
        registry.mark_health("svc", "a", false);
        registry.refresh().await.ok();

        let all = registry.all_instances("svc").ok().unwrap_or_default();
        let a = all.iter().find(|i| i.id == "a");
        assert!(matches!(a, Some(i) if !i.healthy));
    }

    // ==================== Lookup Tests ====================

    #[tokio::test]
    async fn test_get_service_unknown() {
        let registry = SharedRegistry::new(Box::new(TestSource::new(HashMap::new())));
        registry.refresh().await.ok();

        let result = registry.get_service("missing");
        assert!(matches!(result, Err(DiscoveryError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_get_service_no_healthy() {
        let map = one_service_map("svc", vec![make_instance("a", "svc", false)]);
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));
        registry.refresh().await.ok();

        let result = registry.get_service("svc");
        assert!(matches!(result, Err(DiscoveryError::NoHealthyInstance(_))));
    }

    #[tokio::test]
    async fn test_get_service_filters_unhealthy() {
        let map = one_service_map(
            "svc",
            vec![make_instance("a", "svc", true), make_instance("b", "svc", false)],
        );
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));
        registry.refresh().await.ok();

        let healthy = registry.get_service("svc").ok().unwrap_or_default();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "a");
    }

    #[tokio::test]
    async fn test_service_names_sorted() {
        let mut map = HashMap::new();
        map.insert("zeta".to_string(), vec![make_instance("z", "zeta", true)]);
        map.insert("alpha".to_string(), vec![make_instance("a", "alpha", true)]);
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));
        registry.refresh().await.ok();

        assert_eq!(registry.service_names(), vec!["alpha", "zeta"]);
    }

    // ==================== Health Callback Tests ====================

    #[tokio::test]
    async fn test_mark_health_fires_callback_on_transition() {
        let map = one_service_map("svc", vec![make_instance("a", "svc", true)]);
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));
        registry.refresh().await.ok();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry.on_health_change(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.mark_health("svc", "a", false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same flag again: no transition, no callback.
        registry.mark_health("svc", "a", false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        registry.mark_health("svc", "a", true);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mark_health_unknown_instance_is_noop() {
        let map = one_service_map("svc", vec![make_instance("a", "svc", true)]);
        let registry = SharedRegistry::new(Box::new(TestSource::new(map)));
        registry.refresh().await.ok();

        registry.mark_health("svc", "ghost", false);
        registry.mark_health("ghost-service", "a", false);

        let healthy = registry.get_service("svc").ok().unwrap_or_default();
        assert_eq!(healthy.len(), 1);
    }

    // ==================== Atomic Swap Tests ====================

    #[tokio::test]
    async fn test_reader_never_sees_torn_snapshot() {
        // Two complete generations; readers must see one or the other.
        let gen1 = one_service_map(
            "svc",
            vec![make_instance("a1", "svc", true), make_instance("a2", "svc", true)],
        );
        let gen2 = one_service_map(
            "svc",
            vec![
                make_instance("b1", "svc", true),
                make_instance("b2", "svc", true),
                make_instance("b3", "svc", true),
            ],
        );

        let source = TestSource::new(gen1);
        source.push(gen2);
        let registry = Arc::new(SharedRegistry::new(Box::new(source)));
        registry.refresh().await.ok();

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let instances = registry.get_service("svc").ok().unwrap_or_default();
                    let ids: Vec<&str> =
                        instances.iter().map(|i| i.id.as_str()).collect();
                    let gen1 = ids == ["a1", "a2"];
                    let gen2 = ids == ["b1", "b2", "b3"];
                    assert!(gen1 || gen2, "torn snapshot observed: {ids:?}");
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            registry.refresh().await.ok();
            tokio::task::yield_now().await;
        }

        assert!(reader.await.is_ok());
    }

    // ==================== Start/Stop Tests ====================

    #[tokio::test]
    async fn test_start_performs_initial_refresh() {
        let map = one_service_map("svc", vec![make_instance("a", "svc", true)]);
        let registry = Arc::new(
            SharedRegistry::new(Box::new(TestSource::new(map)))
                .with_refresh_interval(Duration::from_secs(3600)),
        );

        registry.start().await.ok();
        assert_eq!(registry.get_service("svc").ok().map(|v| v.len()), Some(1));

        registry.stop();
    }

    #[tokio::test]
    async fn test_start_fails_when_initial_refresh_fails() {
        let source = TestSource::new(HashMap::new());
        source.set_fail(true);
        let registry = Arc::new(SharedRegistry::new(Box::new(source)));

        assert!(registry.start().await.is_err());
    }
}
