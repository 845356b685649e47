//! Fixed-list discovery source driven by configuration.

use async_trait::async_trait;

use crate::registry::{DiscoverySource, Result, ServiceMap};
use crate::types::ServiceInstance;

/// A discovery source whose instances come from configuration and never
/// change between refreshes.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    services: ServiceMap,
}

impl StaticSource {
    /// Creates an empty static source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service with its instances.
    #[must_use]
    pub fn with_service(
        mut self,
        name: impl Into<String>,
        instances: Vec<ServiceInstance>,
    ) -> Self {
        self.services.insert(name.into(), instances);
        self
    }

    /// Adds one instance, grouping it under its service name.
    #[must_use]
    pub fn with_instance(mut self, instance: ServiceInstance) -> Self {
        self.services
            .entry(instance.name.clone())
            .or_default()
            .push(instance);
        self
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self) -> Result<ServiceMap> {
        Ok(self.services.clone())
    }
}
