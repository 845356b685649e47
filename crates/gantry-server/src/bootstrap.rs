//! Wires configuration into a running gateway.

use std::sync::Arc;
use std::time::Duration;

use gantry_auth::PolicyStore;
use gantry_discovery::{
    ComposeSource, CompositeSource, DiscoverySource, DockerSource, HealthMonitor,
    KubernetesSource, Registry, SharedRegistry, StaticSource,
};
use gantry_routing::{DynamicRoutes, Router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DescriptorConfig, GatewayConfig, RegistryConfig};
use crate::connector::HttpConnector;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use crate::http::HttpAdapter;
use crate::middleware::{Middleware, RbacLayer, SubjectLayer, TrackingLayer};
use crate::versioning::VersioningLayer;
use crate::websocket::WsAdapter;

/// A fully assembled gateway, ready to serve.
#[derive(Debug)]
pub struct Gateway {
    registry: Arc<SharedRegistry>,
    router: Arc<Router>,
    monitor: Option<Arc<HealthMonitor>>,
    http: Arc<HttpAdapter>,
    websocket: Option<Arc<WsAdapter>>,
    drain_deadline: Duration,
    stop: CancellationToken,
}

impl Gateway {
    /// Builds every component from validated configuration, including the
    /// registry's synchronous initial refresh.
    pub async fn build(config: GatewayConfig) -> ServerResult<Self> {
        config.validate()?;
        let stop = CancellationToken::new();

        // Discovery.
        let mut composite = CompositeSource::new();
        for registry_config in &config.registries {
            composite = composite.with_source(build_source(registry_config));
        }
        let registry = Arc::new(
            SharedRegistry::new(Box::new(composite))
                .with_refresh_interval(config.timeouts.refresh_interval()),
        );
        registry.start().await?;

        // Routing.
        let router = Arc::new(Router::new(
            Arc::clone(&registry) as Arc<dyn Registry>
        ));
        for spec in config.routes.clone() {
            router.add_rule(spec.into_rule()?)?;
        }

        let dynamic = Arc::new(DynamicRoutes::new(Arc::clone(&router)));
        for descriptor in &config.descriptors {
            match descriptor {
                DescriptorConfig::File {
                    path,
                    poll_interval,
                } => {
                    tokio::spawn(Arc::clone(&dynamic).watch_file(
                        path.clone(),
                        Duration::from_secs(*poll_interval),
                        stop.child_token(),
                    ));
                }
                DescriptorConfig::Url { url, poll_interval } => {
                    tokio::spawn(Arc::clone(&dynamic).watch_url(
                        url.clone(),
                        Duration::from_secs(*poll_interval),
                        stop.child_token(),
                    ));
                }
            }
        }

        // Health monitoring.
        let monitor = if config.health_checks.is_empty() {
            None
        } else {
            let monitor = Arc::new(HealthMonitor::new(
                Arc::clone(&registry) as Arc<dyn Registry>
            ));
            for (service, check) in &config.health_checks {
                monitor.add_check(service.clone(), check.clone());
            }
            monitor.start();
            Some(monitor)
        };

        // Middleware chain: tracking, versioning, subject + rbac.
        let mut chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(TrackingLayer::new())];
        if let Some(versioning) = config.versioning.clone() {
            chain.push(Arc::new(VersioningLayer::new(versioning)));
        }
        if let Some(rbac) = &config.rbac {
            chain.push(Arc::new(SubjectLayer::new(rbac.subject_header.clone())));

            let store = PolicyStore::new()
                .with_mode(rbac.mode)
                .with_default_allow(rbac.default_allow)
                .with_cache(
                    Duration::from_secs(rbac.cache_ttl),
                    rbac.cache_max_entries,
                );
            for policy in rbac.policies.clone() {
                store.add_policy(policy)?;
            }
            chain.push(Arc::new(RbacLayer::new(Arc::new(store))));
        }

        // The proxy handler shared by both adapters.
        let handler = Arc::new(
            RequestHandler::new(
                chain.clone(),
                Arc::clone(&router),
                Arc::new(HttpConnector::new()),
            )
            .with_default_timeout(config.timeouts.request_timeout())
            .with_sse_keepalive(Duration::from_secs(config.sse.keepalive_timeout)),
        );

        let http_config = config
            .listeners
            .http
            .clone()
            .ok_or_else(|| ServerError::Internal("validated config lost listener".to_string()))?;
        let http = Arc::new(HttpAdapter::new(
            http_config,
            Arc::clone(&handler),
            Arc::clone(&registry) as Arc<dyn Registry>,
        ));

        let websocket = config.listeners.websocket.clone().map(|ws_config| {
            Arc::new(WsAdapter::new(ws_config, chain, Arc::clone(&router)))
        });

        info!(
            routes = router.len(),
            services = registry.service_names().len(),
            "Gateway assembled"
        );

        Ok(Self {
            registry,
            router,
            monitor,
            http,
            websocket,
            drain_deadline: config.timeouts.drain_deadline(),
            stop,
        })
    }

    /// The shared router (rule inspection, tests).
    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Serves until ctrl-c, then drains and stops every component.
    pub async fn run(self) -> ServerResult<()> {
        let http_task = tokio::spawn(Arc::clone(&self.http).serve());
        let ws_task = self
            .websocket
            .as_ref()
            .map(|ws| tokio::spawn(Arc::clone(ws).serve()));

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Signal handler failed, shutting down");
                }
                info!("Shutdown signal received");
            }
            served = http_task => {
                match served {
                    Ok(Err(e)) => {
                        error!(error = %e, "Http adapter failed");
                        self.shutdown().await;
                        return Err(e);
                    }
                    _ => info!("Http adapter exited"),
                }
            }
        }

        self.shutdown().await;
        if let Some(ws_task) = ws_task {
            ws_task.abort();
        }
        Ok(())
    }

    /// Drains in-flight requests then stops background loops.
    pub async fn shutdown(&self) {
        info!(deadline = ?self.drain_deadline, "Draining active requests");
        self.http.drain(self.drain_deadline).await;

        if let Some(websocket) = &self.websocket {
            websocket.stop();
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        self.router.stop();
        self.registry.stop();
        self.stop.cancel();
        info!("Gateway stopped");
    }
}

fn build_source(config: &RegistryConfig) -> Box<dyn DiscoverySource> {
    match config {
        RegistryConfig::Static { services } => {
            let mut source = StaticSource::new();
            for (name, instances) in services {
                source = source.with_service(name.clone(), instances.clone());
            }
            Box::new(source)
        }
        RegistryConfig::Docker { prefix, network } => {
            let mut source = DockerSource::new();
            if let Some(prefix) = prefix {
                source = source.with_prefix(prefix.clone());
            }
            if let Some(network) = network {
                source = source.with_network(network.clone());
            }
            Box::new(source)
        }
        RegistryConfig::Compose {
            files,
            env_file,
            project,
        } => {
            let mut source = ComposeSource::new(files.clone());
            if let Some(env_file) = env_file {
                source = source.with_env_file(env_file.clone());
            }
            if let Some(project) = project {
                source = source.with_project(project.clone());
            }
            Box::new(source)
        }
        RegistryConfig::Kubernetes {
            namespace,
            annotation,
            api_base,
            token,
        } => {
            let mut source = match (api_base, token) {
                (Some(api_base), Some(token)) => KubernetesSource::new(api_base, token),
                _ => match KubernetesSource::in_cluster() {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(error = %e, "Kubernetes source unavailable, starting empty");
                        KubernetesSource::new("https://kubernetes.default.svc", String::new())
                    }
                },
            };
            if let Some(namespace) = namespace {
                source = source.with_namespace(namespace.clone());
            }
            if let Some(annotation) = annotation {
                source = source.with_annotation(annotation.clone());
            }
            Box::new(source)
        }
    }
}
