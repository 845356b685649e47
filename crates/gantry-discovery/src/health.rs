//! Backend health monitoring.
//!
//! The monitor polls every instance of each configured service with a
//! registered checker, flips the instance's health flag in the registry on
//! any success or failure, and invokes update callbacks only on transitions.
//! `consecutive_fails` is tracked for operators but does not gate the flip.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::types::{HealthCheckConfig, ServiceInstance};

/// Which probe a service's health check uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// HTTP GET against a health path, healthy iff status < 400.
    #[default]
    Http,
    /// TCP dial-and-close.
    Tcp,
    /// gRPC health-service reachability probe.
    Grpc,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Tcp => write!(f, "tcp"),
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

/// A single health probe implementation.
#[async_trait]
pub trait HealthChecker: Send + Sync + fmt::Debug {
    /// Probes one instance; `Err` carries a short failure description.
    async fn check(
        &self,
        instance: &ServiceInstance,
        config: &HealthCheckConfig,
    ) -> std::result::Result<(), String>;
}

/// HTTP GET checker.
#[derive(Debug, Clone, Default)]
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    /// Creates a checker with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(
        &self,
        instance: &ServiceInstance,
        config: &HealthCheckConfig,
    ) -> std::result::Result<(), String> {
        let path = instance
            .metadata
            .get("health_path")
            .map_or(config.path.as_str(), String::as_str);
        let scheme = if instance.scheme.is_secure() { "https" } else { "http" };
        let url = format!("{scheme}://{}{path}", instance.authority());

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if status.as_u16() < 400 {
            Ok(())
        } else {
            Err(format!("unhealthy status {status}"))
        }
    }
}

/// TCP dial-and-close checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpChecker;

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(
        &self,
        instance: &ServiceInstance,
        _config: &HealthCheckConfig,
    ) -> std::result::Result<(), String> {
        TcpStream::connect(instance.authority())
            .await
            .map(drop)
            .map_err(|e| format!("connect failed: {e}"))
    }
}

/// gRPC health checker.
///
/// Probes the standard health-service path over HTTP/2 with prior
/// knowledge; any response from the server counts as reachable, since real
/// gRPC transports live behind the connector seam.
#[derive(Debug, Clone)]
pub struct GrpcChecker {
    client: reqwest::Client,
}

impl Default for GrpcChecker {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl GrpcChecker {
    /// Creates a checker with an HTTP/2 client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthChecker for GrpcChecker {
    async fn check(
        &self,
        instance: &ServiceInstance,
        _config: &HealthCheckConfig,
    ) -> std::result::Result<(), String> {
        let scheme = if instance.scheme.is_secure() { "https" } else { "http" };
        let url = format!(
            "{scheme}://{}/grpc.health.v1.Health/Check",
            instance.authority()
        );

        self.client
            .post(&url)
            .header("content-type", "application/grpc")
            .send()
            .await
            .map(drop)
            .map_err(|e| format!("grpc probe failed: {e}"))
    }
}

/// Tracked health state of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceHealth {
    /// Result of the most recent check.
    pub healthy: bool,
    /// When the last check ran.
    pub last_check: DateTime<Utc>,
    /// Consecutive failures since the last success (advisory).
    pub consecutive_fails: u32,
    /// Description of the last failure, if any.
    pub last_error: Option<String>,
}

type UpdateCallback = Box<dyn Fn(&str, &str, bool) + Send + Sync>;

/// Polls configured services and feeds health transitions into the
/// registry.
pub struct HealthMonitor {
    registry: Arc<dyn Registry>,
    checks: RwLock<HashMap<String, HealthCheckConfig>>,
    checkers: RwLock<HashMap<CheckKind, Arc<dyn HealthChecker>>>,
    states: Mutex<HashMap<String, InstanceHealth>>,
    callbacks: RwLock<Vec<UpdateCallback>>,
    stop: CancellationToken,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("services", &self.checks.read().len())
            .field("tracked_instances", &self.states.lock().len())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a monitor with the default HTTP/TCP/gRPC checkers.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        let mut checkers: HashMap<CheckKind, Arc<dyn HealthChecker>> = HashMap::new();
        checkers.insert(CheckKind::Http, Arc::new(HttpChecker::new()));
        checkers.insert(CheckKind::Tcp, Arc::new(TcpChecker));
        checkers.insert(CheckKind::Grpc, Arc::new(GrpcChecker::new()));

        Self {
            registry,
            checks: RwLock::new(HashMap::new()),
            checkers: RwLock::new(checkers),
            states: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Adds (or replaces) the check configuration for a service.
    pub fn add_check(&self, service: impl Into<String>, config: HealthCheckConfig) {
        self.checks.write().insert(service.into(), config);
    }

    /// Replaces the checker registered for a kind.
    pub fn register_checker(&self, kind: CheckKind, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().insert(kind, checker);
    }

    /// Registers a callback invoked on health transitions:
    /// `(service, instance_id, healthy)`.
    pub fn on_update(&self, callback: impl Fn(&str, &str, bool) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Returns the tracked state of an instance.
    #[must_use]
    pub fn state(&self, instance_id: &str) -> Option<InstanceHealth> {
        self.states.lock().get(instance_id).cloned()
    }

    /// Spawns one polling loop per configured service.
    pub fn start(self: &Arc<Self>) {
        let checks: Vec<(String, HealthCheckConfig)> = self
            .checks
            .read()
            .iter()
            .map(|(s, c)| (s.clone(), c.clone()))
            .collect();

        for (service, config) in checks {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = monitor.stop.cancelled() => break,
                        _ = ticker.tick() => {
                            monitor.check_service(&service, &config).await;
                        }
                    }
                }
                debug!(service = %service, "Health check loop stopped");
            });
        }
    }

    /// Stops all polling loops.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Runs one check pass over every instance of `service`.
    pub async fn check_service(&self, service: &str, config: &HealthCheckConfig) {
        let instances = match self.registry.all_instances(service) {
            Ok(instances) => instances,
            Err(e) => {
                debug!(service, error = %e, "Skipping health pass");
                return;
            }
        };

        let checker = self.checkers.read().get(&config.kind).cloned();
        let Some(checker) = checker else {
            warn!(service, kind = %config.kind, "No checker registered");
            return;
        };

        for instance in instances {
            let result = match tokio::time::timeout(
                config.timeout,
                checker.check(&instance, config),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(format!("check timed out after {:?}", config.timeout)),
            };

            let healthy = result.is_ok();
            let transitioned = self.update_state(&instance, result);

            if transitioned {
                self.registry.mark_health(service, &instance.id, healthy);
                for callback in self.callbacks.read().iter() {
                    callback(service, &instance.id, healthy);
                }
            }
        }
    }

    /// Updates tracked state; returns true when the healthy flag flipped.
    fn update_state(
        &self,
        instance: &ServiceInstance,
        result: std::result::Result<(), String>,
    ) -> bool {
        let mut states = self.states.lock();
        let state = states
            .entry(instance.id.clone())
            .or_insert_with(|| InstanceHealth {
                healthy: instance.healthy,
                last_check: Utc::now(),
                consecutive_fails: 0,
                last_error: None,
            });

        let was_healthy = state.healthy;
        state.last_check = Utc::now();

        match result {
            Ok(()) => {
                state.healthy = true;
                state.consecutive_fails = 0;
                state.last_error = None;
            }
            Err(message) => {
                state.healthy = false;
                state.consecutive_fails = state.consecutive_fails.saturating_add(1);
                state.last_error = Some(message);
            }
        }

        state.healthy != was_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DiscoverySource, SharedRegistry};
    use crate::static_source::StaticSource;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct ScriptedChecker {
        results: Mutex<VecDeque<std::result::Result<(), String>>>,
    }

    impl ScriptedChecker {
        fn new(results: Vec<std::result::Result<(), String>>) -> Self {
            Self {
                results: Mutex::new(results.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn check(
            &self,
            _instance: &ServiceInstance,
            _config: &HealthCheckConfig,
        ) -> std::result::Result<(), String> {
            self.results.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    #[derive(Debug)]
    struct SleepyChecker;

    #[async_trait]
    impl HealthChecker for SleepyChecker {
        async fn check(
            &self,
            _instance: &ServiceInstance,
            _config: &HealthCheckConfig,
        ) -> std::result::Result<(), String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    async fn registry_with_instance(healthy: bool) -> Arc<SharedRegistry> {
        let source = StaticSource::new().with_instance(
            ServiceInstance::builder("i-1", "svc", "10.0.0.1", 8080)
                .healthy(healthy)
                .build(),
        );
        let registry = Arc::new(SharedRegistry::new(Box::new(source)));
        registry.refresh().await.ok();
        registry
    }

    fn tcp_config(timeout: Duration) -> HealthCheckConfig {
        HealthCheckConfig {
            kind: CheckKind::Tcp,
            timeout,
            ..HealthCheckConfig::default()
        }
    }

    // ==================== Transition Tests ====================

    #[tokio::test]
    async fn test_failure_flips_healthy_and_fires_callback_once() {
        let registry = registry_with_instance(true).await;
        let monitor = Arc::new(HealthMonitor::new(registry.clone()));
        monitor.register_checker(
            CheckKind::Tcp,
            Arc::new(ScriptedChecker::new(vec![
                Err("down".to_string()),
                Err("still down".to_string()),
            ])),
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.on_update(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let config = tcp_config(Duration::from_secs(1));
        monitor.check_service("svc", &config).await;
        monitor.check_service("svc", &config).await;

        // Only the first failure is a transition.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(registry.get_service("svc").is_err());

        let state = monitor.state("i-1").unwrap();
        assert!(!state.healthy);
        assert_eq!(state.consecutive_fails, 2);
        assert_eq!(state.last_error.as_deref(), Some("still down"));
    }

    #[tokio::test]
    async fn test_recovery_flips_back() {
        let registry = registry_with_instance(false).await;
        let monitor = Arc::new(HealthMonitor::new(registry.clone()));
        monitor.register_checker(
            CheckKind::Tcp,
            Arc::new(ScriptedChecker::new(vec![Ok(())])),
        );

        let config = tcp_config(Duration::from_secs(1));
        monitor.check_service("svc", &config).await;

        let healthy = registry.get_service("svc").ok().unwrap_or_default();
        assert_eq!(healthy.len(), 1);

        let state = monitor.state("i-1").unwrap();
        assert!(state.healthy);
        assert_eq!(state.consecutive_fails, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_success_without_transition_is_silent() {
        let registry = registry_with_instance(true).await;
        let monitor = Arc::new(HealthMonitor::new(registry));
        monitor.register_checker(
            CheckKind::Tcp,
            Arc::new(ScriptedChecker::new(vec![Ok(()), Ok(())])),
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.on_update(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let config = tcp_config(Duration::from_secs(1));
        monitor.check_service("svc", &config).await;
        monitor.check_service("svc", &config).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    // ==================== Timeout Tests ====================

    #[tokio::test]
    async fn test_slow_check_counts_as_failure() {
        let registry = registry_with_instance(true).await;
        let monitor = Arc::new(HealthMonitor::new(registry.clone()));
        monitor.register_checker(CheckKind::Tcp, Arc::new(SleepyChecker));

        let config = tcp_config(Duration::from_millis(10));
        monitor.check_service("svc", &config).await;

        let state = monitor.state("i-1").unwrap();
        assert!(!state.healthy);
        assert!(state.last_error.unwrap_or_default().contains("timed out"));
    }

    // ==================== Misc Tests ====================

    #[tokio::test]
    async fn test_unknown_service_is_noop() {
        let registry = registry_with_instance(true).await;
        let monitor = Arc::new(HealthMonitor::new(registry));
        let config = tcp_config(Duration::from_secs(1));
        monitor.check_service("ghost", &config).await;
        assert!(monitor.state("i-1").is_none());
    }

    #[tokio::test]
    async fn test_static_source_name() {
        // Checker kinds render stably into config and logs.
        assert_eq!(CheckKind::Http.to_string(), "http");
        assert_eq!(CheckKind::Tcp.to_string(), "tcp");
        assert_eq!(CheckKind::Grpc.to_string(), "grpc");
        let source = StaticSource::new();
        assert_eq!(DiscoverySource::name(&source), "static");
    }
}
