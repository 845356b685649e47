//! Core types for service discovery.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport scheme for reaching a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain HTTP.
    #[default]
    Http,
    /// HTTP over TLS.
    Https,
    /// WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
    /// gRPC (HTTP/2).
    Grpc,
}

impl Scheme {
    /// Parses a scheme string; unknown values map to `Http`.
    #[must_use]
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "https" => Self::Https,
            "ws" => Self::Ws,
            "wss" => Self::Wss,
            "grpc" => Self::Grpc,
            _ => Self::Http,
        }
    }

    /// Returns true for TLS-carrying schemes.
    #[must_use]
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Ws => write!(f, "ws"),
            Self::Wss => write!(f, "wss"),
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

/// One reachable backend endpoint for a named service.
///
/// Instances are created and mutated only by a registry; everything else
/// holds them by value or refers to them by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Stable identifier within the discovery source.
    pub id: String,
    /// Logical service name this instance serves.
    pub name: String,
    /// Host or IP address.
    pub address: String,
    /// Port.
    pub port: u16,
    /// Transport scheme.
    #[serde(default)]
    pub scheme: Scheme,
    /// Whether the instance may receive traffic.
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    /// Free-form source metadata (weights, health paths, labels).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_healthy() -> bool {
    true
}

impl ServiceInstance {
    /// Starts building an instance.
    #[must_use]
    pub fn builder(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> ServiceInstanceBuilder {
        ServiceInstanceBuilder::new(id, name, address, port)
    }

    /// `address:port` form.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// `scheme://address:port` form.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.address, self.port)
    }

    /// Load-balancing weight from metadata (`weight` key, default 1).
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }
}

/// Builder for [`ServiceInstance`].
#[derive(Debug)]
pub struct ServiceInstanceBuilder {
    id: String,
    name: String,
    address: String,
    port: u16,
    scheme: Scheme,
    healthy: bool,
    metadata: HashMap<String, String>,
}

impl ServiceInstanceBuilder {
    fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            scheme: Scheme::Http,
            healthy: true,
            metadata: HashMap::new(),
        }
    }

    /// Sets the transport scheme.
    #[must_use]
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Sets the initial health flag.
    #[must_use]
    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the load-balancing weight via metadata.
    #[must_use]
    pub fn weight(self, weight: u32) -> Self {
        self.metadata("weight", weight.to_string())
    }

    /// Builds the instance.
    #[must_use]
    pub fn build(self) -> ServiceInstance {
        ServiceInstance {
            id: self.id,
            name: self.name,
            address: self.address,
            port: self.port,
            scheme: self.scheme,
            healthy: self.healthy,
            metadata: self.metadata,
        }
    }
}

/// Health check configuration for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Which checker to use.
    #[serde(default)]
    pub kind: crate::health::CheckKind,
    /// Path probed by the HTTP checker.
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Interval between checks.
    #[serde(default = "default_interval", with = "duration_secs")]
    pub interval: Duration,
    /// Per-check timeout.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: crate::health::CheckKind::default(),
            path: default_health_path(),
            interval: default_interval(),
            timeout: default_timeout(),
        }
    }
}

/// Serializes a `Duration` as whole seconds, the way config files write it.
pub(crate) mod duration_secs {
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
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
