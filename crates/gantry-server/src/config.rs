//! Gateway configuration.
//!
//! Loaded from a YAML or JSON file. The core never reads files itself;
//! everything it needs arrives through this structure. Validation enforces
//! the hard requirements: an HTTP listener port, at least one registry,
//! and at least one route (inline or via a descriptor source).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gantry_auth::{EnforcementMode, Policy};
use gantry_discovery::types::HealthCheckConfig;
use gantry_discovery::ServiceInstance;
use gantry_routing::RuleSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::versioning::VersioningConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed.
    #[error("failed to parse config {path}: {reason}")]
    Parse {
        /// Offending path.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Front-end listeners.
    pub listeners: ListenersConfig,
    /// Discovery sources; at least one is required.
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    /// Inline route rules.
    #[serde(default)]
    pub routes: Vec<RuleSpec>,
    /// Dynamic descriptor sources.
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
    /// Per-service health checks.
    #[serde(default)]
    pub health_checks: HashMap<String, HealthCheckConfig>,
    /// RBAC settings; absent disables the layer.
    #[serde(default)]
    pub rbac: Option<RbacConfig>,
    /// Versioning settings; absent disables the layer.
    #[serde(default)]
    pub versioning: Option<VersioningConfig>,
    /// SSE behavior.
    #[serde(default)]
    pub sse: SseConfig,
    /// Request and shutdown timing.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl GatewayConfig {
    /// Loads a config file; the format is chosen by extension (`.json`
    /// parses as JSON, anything else as YAML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Enforces the required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.http.is_none() {
            return Err(ConfigError::Invalid(
                "listeners.http with a port is required".to_string(),
            ));
        }
        if self.registries.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one registry is required".to_string(),
            ));
        }
        if self.routes.is_empty() && self.descriptors.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one route or descriptor source is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listener set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenersConfig {
    /// HTTP (and SSE) listener.
    #[serde(default)]
    pub http: Option<HttpListenerConfig>,
    /// WebSocket listener.
    #[serde(default)]
    pub websocket: Option<WsListenerConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpListenerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (required).
    pub port: u16,
    /// Whether a TLS terminator sits in front of this listener; drives
    /// `X-Forwarded-Proto`.
    #[serde(default)]
    pub tls_terminated: bool,
    /// Health endpoint exposure.
    #[serde(default)]
    pub health: HealthEndpointsConfig,
}

impl HttpListenerConfig {
    /// The socket address string.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Health/readiness endpoints served before routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEndpointsConfig {
    /// Whether the endpoints are exposed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Liveness-and-overall path.
    #[serde(default = "default_health_path")]
    pub health: String,
    /// Readiness path.
    #[serde(default = "default_ready_path")]
    pub ready: String,
    /// Liveness path.
    #[serde(default = "default_live_path")]
    pub live: String,
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_ready_path() -> String {
    "/ready".to_string()
}

fn default_live_path() -> String {
    "/live".to_string()
}

impl Default for HealthEndpointsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health: default_health_path(),
            ready: default_ready_path(),
            live: default_live_path(),
        }
    }
}

/// WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsListenerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Seconds of read inactivity before the connection closes.
    #[serde(default = "default_ws_read_timeout")]
    pub read_timeout: u64,
    /// Seconds allowed per outbound write.
    #[serde(default = "default_ws_write_timeout")]
    pub write_timeout: u64,
}

impl WsListenerConfig {
    /// The socket address string.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_ws_read_timeout() -> u64 {
    300
}

fn default_ws_write_timeout() -> u64 {
    10
}

/// One discovery source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryConfig {
    /// Fixed instances from this file.
    Static {
        /// Instances grouped by service name.
        services: HashMap<String, Vec<ServiceInstance>>,
    },
    /// Docker label discovery.
    Docker {
        /// Label prefix (default `gateway`).
        #[serde(default)]
        prefix: Option<String>,
        /// Restrict addresses to one Docker network.
        #[serde(default)]
        network: Option<String>,
    },
    /// Docker Compose discovery.
    Compose {
        /// Compose files, merged in order.
        files: Vec<PathBuf>,
        /// Env file for `${VAR}` substitution.
        #[serde(default)]
        env_file: Option<PathBuf>,
        /// Explicit compose project name.
        #[serde(default)]
        project: Option<String>,
    },
    /// Kubernetes API discovery.
    Kubernetes {
        /// Restrict to one namespace.
        #[serde(default)]
        namespace: Option<String>,
        /// Opt-in annotation key.
        #[serde(default)]
        annotation: Option<String>,
        /// Explicit API base (off-cluster use); in-cluster settings apply
        /// when absent.
        #[serde(default)]
        api_base: Option<String>,
        /// Bearer token paired with `api_base`.
        #[serde(default)]
        token: Option<String>,
    },
}

/// One dynamic descriptor source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DescriptorConfig {
    /// A descriptor file watched by modification time.
    File {
        /// File path.
        path: PathBuf,
        /// Poll interval in seconds.
        #[serde(default = "default_poll_secs")]
        poll_interval: u64,
    },
    /// A descriptor URL polled for content changes.
    Url {
        /// Descriptor URL.
        url: String,
        /// Poll interval in seconds.
        #[serde(default = "default_poll_secs")]
        poll_interval: u64,
    },
}

fn default_poll_secs() -> u64 {
    30
}

/// RBAC layer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RbacConfig {
    /// Enforcement mode.
    #[serde(default)]
    pub mode: EnforcementMode,
    /// Pass subjects that match no permission.
    #[serde(default)]
    pub default_allow: bool,
    /// Header the subject layer reads into the request context.
    #[serde(default = "default_subject_header")]
    pub subject_header: String,
    /// Decision-cache TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Decision-cache capacity.
    #[serde(default = "default_cache_entries")]
    pub cache_max_entries: usize,
    /// Inline policies.
    #[serde(default)]
    pub policies: Vec<Policy>,
}

fn default_subject_header() -> String {
    "X-Auth-Subject".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_entries() -> usize {
    10_000
}

/// SSE behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SseConfig {
    /// Seconds between keepalive comments; zero disables them.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_timeout: u64,
}

fn default_keepalive_secs() -> u64 {
    15
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout: default_keepalive_secs(),
        }
    }
}

/// Request and shutdown timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default per-request timeout in seconds (rules may override).
    #[serde(default = "default_request_secs")]
    pub request: u64,
    /// Graceful-shutdown drain deadline in seconds.
    #[serde(default = "default_drain_secs")]
    pub shutdown_drain: u64,
    /// Registry refresh interval in seconds.
    #[serde(default = "default_refresh_secs")]
    pub registry_refresh: u64,
}

fn default_request_secs() -> u64 {
    30
}

fn default_drain_secs() -> u64 {
    30
}

fn default_refresh_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: default_request_secs(),
            shutdown_drain: default_drain_secs(),
            registry_refresh: default_refresh_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Default request timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request)
    }

    /// Drain deadline as a duration.
    #[must_use]
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain)
    }

    /// Registry refresh interval as a duration.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.registry_refresh)
    }
}
