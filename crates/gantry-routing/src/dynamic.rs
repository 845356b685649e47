//! Dynamic route management keyed by descriptor source.
//!
//! Each source (a file path or URL) owns the set of rules it installed;
//! installed rule ids are prefixed with `<source>:` so two sources can
//! never collide. A change event replaces the source's whole set. File
//! sources are watched by modification-time polling; URL sources are
//! polled and re-applied when the fetched content changes.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::OpenApiDescriptor;
use crate::router::{Router, RoutingError};
use crate::rule::RuleSpec;

/// Default poll interval for descriptor watchers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Installs and reconciles per-source route sets on a shared router.
#[derive(Debug)]
pub struct DynamicRoutes {
    router: Arc<Router>,
    sources: Mutex<HashMap<String, Vec<String>>>,
}

impl DynamicRoutes {
    /// Creates a manager over the router.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the rule set contributed by `source`.
    ///
    /// Individual rules that fail to compile are skipped with a warning so
    /// one bad descriptor entry cannot take down a reload. Returns the
    /// number of rules installed.
    pub fn update_routes(&self, source: &str, specs: Vec<RuleSpec>) -> usize {
        self.remove_routes(source);

        let mut installed = Vec::new();
        for mut spec in specs {
            spec.id = format!("{source}:{}", spec.id);
            let id = spec.id.clone();

            let rule = match spec.into_rule() {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(source, rule = %id, error = %e, "Skipping invalid dynamic rule");
                    continue;
                }
            };

            match self.router.add_rule(rule) {
                Ok(()) => installed.push(id),
                Err(RoutingError::DuplicateRule(duplicate)) => {
                    warn!(source, rule = %duplicate, "Skipping duplicate dynamic rule");
                }
                Err(e) => {
                    warn!(source, rule = %id, error = %e, "Failed to install dynamic rule");
                }
            }
        }

        let count = installed.len();
        self.sources.lock().insert(source.to_string(), installed);
        info!(source, rules = count, "Updated dynamic routes");
        count
    }

    /// Removes every rule contributed by `source`. Returns how many were
    /// dropped.
    pub fn remove_routes(&self, source: &str) -> usize {
        let Some(ids) = self.sources.lock().remove(source) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if self.router.remove_rule(&id).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(source, rules = removed, "Removed dynamic routes");
        }
        removed
    }

    /// Lists known sources.
    #[must_use]
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.sources.lock().keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Rule ids installed by a source.
    #[must_use]
    pub fn rules_for(&self, source: &str) -> Vec<String> {
        self.sources.lock().get(source).cloned().unwrap_or_default()
    }

    /// Loads a descriptor file and installs its rules under the file path
    /// as source.
    pub fn load_file(&self, path: &PathBuf) -> Result<usize, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("read {}: {e}", path.display()))?;
        let descriptor = OpenApiDescriptor::parse(&text)?;
        Ok(self.update_routes(&path.display().to_string(), descriptor.to_rule_specs()))
    }

    /// Watches a descriptor file by polling its modification time.
    ///
    /// The initial load happens on the first tick; afterwards the set is
    /// reloaded whenever the timestamp moves.
    pub async fn watch_file(
        self: Arc<Self>,
        path: PathBuf,
        interval: Duration,
        stop: CancellationToken,
    ) {
        let mut last_modified: Option<SystemTime> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                    if modified == last_modified && last_modified.is_some() {
                        continue;
                    }
                    last_modified = modified;
                    match self.load_file(&path) {
                        Ok(count) => {
                            debug!(path = %path.display(), rules = count, "Reloaded descriptor file");
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Descriptor reload failed");
                        }
                    }
                }
            }
        }
        debug!(path = %path.display(), "File watcher stopped");
    }

    /// Polls a descriptor URL; the rule set is re-applied when the fetched
    /// content changes.
    pub async fn watch_url(
        self: Arc<Self>,
        url: String,
        interval: Duration,
        stop: CancellationToken,
    ) {
        let client = reqwest::Client::new();
        let mut last_hash: Option<u64> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let text = match client.get(&url).send().await {
                        Ok(response) if response.status().is_success() => {
                            match response.text().await {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!(url = %url, error = %e, "Descriptor body read failed");
                                    continue;
                                }
                            }
                        }
                        Ok(response) => {
                            warn!(url = %url, status = %response.status(), "Descriptor poll failed");
                            continue;
                        }
                        Err(e) => {
                            warn!(url = %url, error = %e, "Descriptor poll failed");
                            continue;
                        }
                    };

                    let mut hasher = DefaultHasher::new();
                    text.hash(&mut hasher);
                    let hash = hasher.finish();
                    if last_hash == Some(hash) {
                        continue;
                    }
                    last_hash = Some(hash);

                    match OpenApiDescriptor::parse(&text) {
                        Ok(descriptor) => {
                            let count = self.update_routes(&url, descriptor.to_rule_specs());
                            debug!(url = %url, rules = count, "Reloaded descriptor url");
                        }
                        Err(e) => {
                            warn!(url = %url, error = %e, "Descriptor parse failed");
                        }
                    }
                }
            }
        }
        debug!(url = %url, "Url watcher stopped");
    }
}
