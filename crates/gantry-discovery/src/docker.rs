//! Label-driven discovery over the Docker CLI.
//!
//! Containers opt in with `<prefix>.service` (the service name they back).
//! Further labels refine the instance:
//!
//! - `<prefix>.port` — backend port (required; containers without it are
//!   skipped with a warning)
//! - `<prefix>.scheme` — transport scheme, default `http`
//! - `<prefix>.health` — health check path, stored as `health_path` metadata
//! - `<prefix>.meta.<key>` — free-form metadata entries
//!
//! An optional network filter selects which network's IP address is used;
//! without it, the first network with an address wins.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::registry::{DiscoveryError, DiscoverySource, Result, ServiceMap};
use crate::types::{Scheme, ServiceInstance};

/// Default label prefix.
pub const DEFAULT_LABEL_PREFIX: &str = "gateway";

/// Runs a docker CLI command and returns its stdout.
pub(crate) async fn run_docker(binary: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| DiscoveryError::Source(format!("docker {} timed out", args.join(" "))))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DiscoveryError::Source(format!(
            "docker {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `docker inspect` output, reduced to the fields discovery needs.
#[derive(Debug, Deserialize)]
pub(crate) struct ContainerInspect {
    /// Full container id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Container config (labels live here).
    #[serde(rename = "Config")]
    pub config: ContainerConfig,
    /// Network attachments.
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, NetworkAttachment>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkAttachment {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// Discovery source backed by Docker container labels.
#[derive(Debug, Clone)]
pub struct DockerSource {
    prefix: String,
    network: Option<String>,
    binary: String,
    command_timeout: Duration,
}

impl Default for DockerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSource {
    /// Creates a source with the default `gateway` label prefix.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_LABEL_PREFIX.to_string(),
            network: None,
            binary: "docker".to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the label prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Restricts instance addresses to the given Docker network.
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Overrides the docker binary path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Extracts a service instance from one inspected container.
    ///
    /// Returns `None` (with a warning) when required labels are missing or
    /// no usable address exists.
    pub(crate) fn instance_from_container(
        &self,
        container: &ContainerInspect,
    ) -> Option<ServiceInstance> {
        let labels = &container.config.labels;
        let short_id: String = container.id.chars().take(12).collect();

        let service = labels.get(&format!("{}.service", self.prefix))?.clone();

        let Some(port) = labels
            .get(&format!("{}.port", self.prefix))
            .and_then(|p| p.parse::<u16>().ok())
        else {
            warn!(
                container = %short_id,
                service,
                "Skipping container without a valid port label"
            );
            return None;
        };

        let address = match &self.network {
            Some(network) => container
                .network_settings
                .networks
                .get(network)
                .map(|n| n.ip_address.clone())
                .filter(|ip| !ip.is_empty()),
            None => container
                .network_settings
                .networks
                .values()
                .map(|n| n.ip_address.clone())
                .find(|ip| !ip.is_empty()),
        };
        let Some(address) = address else {
            warn!(
                container = %short_id,
                service,
                "Skipping container without a usable network address"
            );
            return None;
        };

        let scheme = labels
            .get(&format!("{}.scheme", self.prefix))
            .map_or(Scheme::Http, |s| Scheme::parse_lossy(s));

        let mut builder = ServiceInstance::builder(short_id, service, address, port).scheme(scheme);

        if let Some(path) = labels.get(&format!("{}.health", self.prefix)) {
            builder = builder.metadata("health_path", path.clone());
        }

        let meta_prefix = format!("{}.meta.", self.prefix);
        for (key, value) in labels {
            if let Some(stripped) = key.strip_prefix(&meta_prefix) {
                builder = builder.metadata(stripped.to_string(), value.clone());
            }
        }

        Some(builder.build())
    }

    /// Groups instances by service name.
    pub(crate) fn group_instances(instances: Vec<ServiceInstance>) -> ServiceMap {
        let mut map: ServiceMap = HashMap::new();
        for instance in instances {
            map.entry(instance.name.clone()).or_default().push(instance);
        }
        map
    }
}

#[async_trait]
impl DiscoverySource for DockerSource {
    fn name(&self) -> &str {
        "docker"
    }

    async fn discover(&self) -> Result<ServiceMap> {
        let label_filter = format!("label={}.service", self.prefix);
        let ps = run_docker(
            &self.binary,
            &["ps", "--filter", &label_filter, "--format", "{{.ID}}"],
            self.command_timeout,
        )
        .await?;

        let ids: Vec<&str> = ps.lines().filter(|l| !l.trim().is_empty()).collect();
        if ids.is_empty() {
            debug!(prefix = %self.prefix, "No labeled containers running");
            return Ok(HashMap::new());
        }

        let mut args = vec!["inspect"];
        args.extend(ids.iter().copied());
        let inspect = run_docker(&self.binary, &args, self.command_timeout).await?;

        let containers: Vec<ContainerInspect> = serde_json::from_str(&inspect)
            .map_err(|e| DiscoveryError::Parse(format!("docker inspect output: {e}")))?;

        let instances: Vec<ServiceInstance> = containers
            .iter()
            .filter_map(|c| self.instance_from_container(c))
            .collect();

        debug!(
            containers = containers.len(),
            instances = instances.len(),
            "Docker discovery pass complete"
        );
        Ok(Self::group_instances(instances))
    }
}
