//! Kubernetes discovery over the in-cluster API.
//!
//! Services opt in with the `gateway/enabled: "true"` annotation. A
//! LoadBalancer service yields one instance per ingress point; other
//! non-headless services yield one instance at their cluster IP; headless
//! services are skipped.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::registry::{DiscoveryError, DiscoverySource, Result, ServiceMap};
use crate::types::{Scheme, ServiceInstance};

/// Default opt-in annotation.
pub const DEFAULT_ANNOTATION: &str = "gateway/enabled";

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Discovery source backed by the Kubernetes API.
#[derive(Debug, Clone)]
pub struct KubernetesSource {
    api_base: String,
    token: String,
    namespace: Option<String>,
    annotation: String,
    client: reqwest::Client,
}

impl KubernetesSource {
    /// Creates a source against an explicit API endpoint and bearer token.
    #[must_use]
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            token: token.into(),
            namespace: None,
            annotation: DEFAULT_ANNOTATION.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Creates a source from the in-cluster service-account environment.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| DiscoveryError::Source("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let token = std::fs::read_to_string(TOKEN_PATH)?.trim().to_string();

        let mut builder = reqwest::Client::builder();
        if Path::new(CA_PATH).exists() {
            let ca = std::fs::read(CA_PATH)?;
            let cert = reqwest::Certificate::from_pem(&ca)
                .map_err(|e| DiscoveryError::Source(format!("invalid cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| DiscoveryError::Source(format!("http client: {e}")))?;

        Ok(Self {
            api_base: format!("https://{host}:{port}"),
            token,
            namespace: None,
            annotation: DEFAULT_ANNOTATION.to_string(),
            client,
        })
    }

    /// Restricts discovery to one namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Overrides the opt-in annotation key.
    #[must_use]
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    fn services_url(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/api/v1/namespaces/{ns}/services", self.api_base),
            None => format!("{}/api/v1/services", self.api_base),
        }
    }

    /// Converts a service list into discovered instances.
    pub(crate) fn instances_from_list(&self, list: &ServiceList) -> ServiceMap {
        let mut map: ServiceMap = HashMap::new();
        for service in &list.items {
            if service
                .metadata
                .annotations
                .get(&self.annotation)
                .map(String::as_str)
                != Some("true")
            {
                continue;
            }
            for instance in Self::instances_for(service) {
                map.entry(instance.name.clone()).or_default().push(instance);
            }
        }
        map
    }

    fn instances_for(service: &KubeService) -> Vec<ServiceInstance> {
        let name = service.metadata.name.clone();
        let namespace = service.metadata.namespace.clone();

        let Some(port) = service
            .spec
            .ports
            .first()
            .and_then(|p| u16::try_from(p.port).ok())
        else {
            warn!(service = %name, "Skipping kubernetes service without ports");
            return Vec::new();
        };

        let scheme = service
            .metadata
            .annotations
            .get("gateway/scheme")
            .map_or(Scheme::Http, |s| Scheme::parse_lossy(s));

        let metadata: HashMap<String, String> = service
            .metadata
            .annotations
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("gateway/meta.")
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();

        let build = |id: String, address: String| {
            let mut builder = ServiceInstance::builder(id, name.clone(), address, port)
                .scheme(scheme);
            for (k, v) in &metadata {
                builder = builder.metadata(k.clone(), v.clone());
            }
            builder.build()
        };

        let is_load_balancer = service.spec.service_type.as_deref() == Some("LoadBalancer");
        let ingress = &service.status.load_balancer.ingress;

        if is_load_balancer && !ingress.is_empty() {
            return ingress
                .iter()
                .enumerate()
                .filter_map(|(idx, point)| {
                    let address = point
                        .ip
                        .clone()
                        .or_else(|| point.hostname.clone())
                        .filter(|a| !a.is_empty())?;
                    Some(build(format!("{namespace}/{name}/lb-{idx}"), address))
                })
                .collect();
        }

        match service.spec.cluster_ip.as_deref() {
            Some("None") | Some("") | None => {
                debug!(service = %name, "Skipping headless kubernetes service");
                Vec::new()
            }
            Some(cluster_ip) => vec![build(format!("{namespace}/{name}"), cluster_ip.to_string())],
        }
    }
}

#[async_trait]
impl DiscoverySource for KubernetesSource {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn discover(&self) -> Result<ServiceMap> {
        let response = self
            .client
            .get(self.services_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DiscoveryError::Source(format!("kubernetes api: {e}")))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Source(format!(
                "kubernetes api returned {}",
                response.status()
            )));
        }

        let list: ServiceList = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Parse(format!("kubernetes service list: {e}")))?;

        let map = self.instances_from_list(&list);
        debug!(
            services = map.len(),
            "Kubernetes discovery pass complete"
        );
        Ok(map)
    }
}

/// `GET /api/v1/services` response, reduced to the fields discovery needs.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct ServiceList {
    #[serde(default)]
    pub items: Vec<KubeService>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KubeService {
    pub metadata: KubeMetadata,
    #[serde(default)]
    pub spec: KubeServiceSpec,
    #[serde(default)]
    pub status: KubeServiceStatus,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KubeMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct KubeServiceSpec {
    #[serde(rename = "clusterIP", default)]
    pub cluster_ip: Option<String>,
    #[serde(rename = "type", default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub ports: Vec<KubeServicePort>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KubeServicePort {
    pub port: i32,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct KubeServiceStatus {
    #[serde(rename = "loadBalancer", default)]
    pub load_balancer: KubeLoadBalancerStatus,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct KubeLoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<KubeIngressPoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KubeIngressPoint {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> ServiceList {
        let json = serde_json::json!({
            "items": [
                {
                    "metadata": {
                        "name": "frontend",
                        "namespace": "prod",
                        "annotations": {
                            "gateway/enabled": "true",
                            "gateway/scheme": "https",
                            "gateway/meta.tier": "edge"
                        }
                    },
                    "spec": {
                        "clusterIP": "10.96.0.10",
                        "type": "LoadBalancer",
                        "ports": [{"port": 443}]
                    },
                    "status": {
                        "loadBalancer": {
                            "ingress": [
                                {"ip": "203.0.113.1"},
                                {"hostname": "lb.example.com"}
                            ]
                        }
                    }
                },
                {
                    "metadata": {
                        "name": "billing",
                        "namespace": "prod",
                        "annotations": {"gateway/enabled": "true"}
                    },
                    "spec": {
                        "clusterIP": "10.96.0.20",
                        "type": "ClusterIP",
                        "ports": [{"port": 8080}]
                    }
                },
                {
                    "metadata": {
                        "name": "headless",
                        "namespace": "prod",
                        "annotations": {"gateway/enabled": "true"}
                    },
                    "spec": {
                        "clusterIP": "None",
                        "ports": [{"port": 5432}]
                    }
                },
                {
                    "metadata": {
                        "name": "not-opted-in",
                        "namespace": "prod"
                    },
                    "spec": {
                        "clusterIP": "10.96.0.30",
                        "ports": [{"port": 80}]
                    }
                }
            ]
        });
        serde_json::from_value(json).ok().unwrap()
    }

    #[test]
    fn test_load_balancer_yields_one_instance_per_ingress() {
        let source = KubernetesSource::new("https://k8s.local", "token");
        let map = source.instances_from_list(&fixture());

        let frontend = map.get("frontend").cloned().unwrap_or_default();
        assert_eq!(frontend.len(), 2);
        assert_eq!(frontend[0].address, "203.0.113.1");
        assert_eq!(frontend[1].address, "lb.example.com");
        assert_eq!(frontend[0].id, "prod/frontend/lb-0");
        assert_eq!(frontend[0].scheme, Scheme::Https);
        assert_eq!(frontend[0].metadata.get("tier"), Some(&"edge".to_string()));
    }

    #[test]
    fn test_cluster_ip_yields_single_instance() {
        let source = KubernetesSource::new("https://k8s.local", "token");
        let map = source.instances_from_list(&fixture());

        let billing = map.get("billing").cloned().unwrap_or_default();
        assert_eq!(billing.len(), 1);
        assert_eq!(billing[0].address, "10.96.0.20");
        assert_eq!(billing[0].port, 8080);
        assert_eq!(billing[0].id, "prod/billing");
    }

    #[test]
    fn test_headless_service_skipped() {
        let source = KubernetesSource::new("https://k8s.local", "token");
        let map = source.instances_from_list(&fixture());
        assert!(!map.contains_key("headless"));
    }

    #[test]
    fn test_unannotated_service_skipped() {
        let source = KubernetesSource::new("https://k8s.local", "token");
        let map = source.instances_from_list(&fixture());
        assert!(!map.contains_key("not-opted-in"));
    }

    #[test]
    fn test_custom_annotation() {
        let source =
            KubernetesSource::new("https://k8s.local", "token").with_annotation("mesh/expose");
        let map = source.instances_from_list(&fixture());
        // Nothing carries the custom annotation.
        assert!(map.is_empty());
    }

    #[test]
    fn test_namespaced_url() {
        let source =
            KubernetesSource::new("https://k8s.local", "token").with_namespace("prod");
        assert_eq!(
            source.services_url(),
            "https://k8s.local/api/v1/namespaces/prod/services"
        );
    }

    #[test]
    fn test_cluster_wide_url() {
        let source = KubernetesSource::new("https://k8s.local", "token");
        assert_eq!(source.services_url(), "https://k8s.local/api/v1/services");
    }
}
