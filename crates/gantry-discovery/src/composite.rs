//! Merges several discovery sources into one view.

use async_trait::async_trait;

use crate::registry::{DiscoverySource, Result, ServiceMap};

/// A source that unions the services of its children.
///
/// Instances for a service name declared by several children are
/// concatenated in child order. Any child failing fails the whole pass, so
/// the registry keeps its last good snapshot instead of silently dropping
/// one child's services.
#[derive(Debug, Default)]
pub struct CompositeSource {
    sources: Vec<Box<dyn DiscoverySource>>,
}

impl CompositeSource {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child source.
    #[must_use]
    pub fn with_source(mut self, source: Box<dyn DiscoverySource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Number of child sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True when no children are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl DiscoverySource for CompositeSource {
    fn name(&self) -> &str {
        "composite"
    }

    async fn discover(&self) -> Result<ServiceMap> {
        let mut merged = ServiceMap::new();
        for source in &self.sources {
            let map = source.discover().await?;
            for (service, instances) in map {
                merged.entry(service).or_default().extend(instances);
            }
        }
        Ok(merged)
    }
}
