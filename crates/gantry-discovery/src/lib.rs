//! # gantry-discovery
//!
//! Service discovery for the Gantry API gateway.
//!
//! A [`DiscoverySource`] produces the current set of backend instances per
//! service name; the [`SharedRegistry`] wraps one source, refreshes it on an
//! interval, and exposes the read-side [`Registry`] contract used by the
//! router. Snapshots are swapped atomically: a reader sees either the full
//! pre-refresh or the full post-refresh state, never a mix.
//!
//! Sources:
//! - [`StaticSource`]: fixed instance list from configuration
//! - [`DockerSource`]: label-driven discovery over the Docker CLI
//! - [`ComposeSource`]: compose files joined to their running containers
//! - [`KubernetesSource`]: annotation-opt-in services from the cluster API
//!
//! The [`HealthMonitor`] polls instances with pluggable checkers and feeds
//! health transitions back into the registry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod compose;
pub mod composite;
pub mod docker;
pub mod health;
pub mod kubernetes;
pub mod registry;
pub mod static_source;
pub mod types;

pub use compose::ComposeSource;
pub use composite::CompositeSource;
pub use docker::DockerSource;
pub use health::{CheckKind, HealthChecker, HealthMonitor, InstanceHealth};
pub use kubernetes::KubernetesSource;
pub use registry::{DiscoveryError, DiscoverySource, Registry, Result, SharedRegistry};
pub use static_source::StaticSource;
pub use types::{HealthCheckConfig, Scheme, ServiceInstance};
