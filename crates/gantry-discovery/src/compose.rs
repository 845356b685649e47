//! Docker Compose discovery: declared services joined to their containers.
//!
//! One or more compose files are merged in order (later files win), with
//! `${VAR}` / `$VAR` substitution from an optional env file overlaid by the
//! live process environment. Declared services are then joined to running
//! containers through the `com.docker.compose.project` /
//! `com.docker.compose.service` labels the compose CLI stamps on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::docker::run_docker;
use crate::registry::{DiscoveryError, DiscoverySource, Result, ServiceMap};
use crate::types::{Scheme, ServiceInstance};

/// Compose label carrying the project name.
const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Compose label carrying the service name.
const SERVICE_LABEL: &str = "com.docker.compose.service";

static VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    // ${VAR} first so the braced form never half-matches as $VAR.
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap_or_else(|_| unreachable!())
});

/// Substitutes `${VAR}` and `$VAR` references; unknown variables become
/// empty strings, matching compose behavior.
pub(crate) fn substitute_vars(raw: &str, env: &HashMap<String, String>) -> String {
    VAR_PATTERN
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Parses `KEY=VALUE` lines from an env file; `#` comments and blank lines
/// are skipped.
pub(crate) fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            env.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    env
}

/// A compose file, reduced to the fields discovery needs.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct ComposeFile {
    #[serde(default)]
    pub services: HashMap<String, ComposeService>,
}

/// A single compose service declaration.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct ComposeService {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    #[serde(default)]
    pub labels: Option<ComposeLabels>,
}

impl ComposeService {
    /// The container-side port of the first published port.
    pub fn container_port(&self) -> Option<u16> {
        self.ports.first().and_then(PortEntry::container_port)
    }

    /// Labels normalized into a map.
    pub fn label_map(&self) -> HashMap<String, String> {
        self.labels.as_ref().map(ComposeLabels::to_map).unwrap_or_default()
    }

    fn merge_from(&mut self, overlay: ComposeService) {
        if overlay.image.is_some() {
            self.image = overlay.image;
        }
        if !overlay.ports.is_empty() {
            self.ports = overlay.ports;
        }
        if overlay.labels.is_some() {
            self.labels = overlay.labels;
        }
    }
}

/// Compose writes ports as strings (`"8080:80"`, `"80/tcp"`) or bare
/// numbers.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum PortEntry {
    /// Bare numeric port.
    Number(u16),
    /// String mapping, possibly `host:container` and/or `/proto` suffixed.
    Mapping(String),
}

impl PortEntry {
    /// Container-side port of this entry.
    pub fn container_port(&self) -> Option<u16> {
        match self {
            Self::Number(port) => Some(*port),
            Self::Mapping(s) => {
                let container_part = s.rsplit(':').next().unwrap_or(s);
                let without_proto = container_part.split('/').next().unwrap_or(container_part);
                without_proto.trim().parse().ok()
            }
        }
    }
}

/// Compose labels appear as a map or a `key=value` list.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum ComposeLabels {
    /// `labels: {a: "1"}` form.
    Map(HashMap<String, String>),
    /// `labels: ["a=1"]` form.
    List(Vec<String>),
}

impl ComposeLabels {
    fn to_map(&self) -> HashMap<String, String> {
        match self {
            Self::Map(map) => map.clone(),
            Self::List(list) => list
                .iter()
                .filter_map(|entry| {
                    entry
                        .split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                })
                .collect(),
        }
    }
}

/// Merges compose files in order; later files override per-service fields.
pub(crate) fn merge_files(files: Vec<ComposeFile>) -> ComposeFile {
    let mut merged = ComposeFile::default();
    for file in files {
        for (name, service) in file.services {
            match merged.services.get_mut(&name) {
                Some(existing) => existing.merge_from(service),
                None => {
                    merged.services.insert(name, service);
                }
            }
        }
    }
    merged
}

/// Discovery source that joins compose-declared services to their running
/// containers.
#[derive(Debug, Clone)]
pub struct ComposeSource {
    files: Vec<PathBuf>,
    env_file: Option<PathBuf>,
    project: Option<String>,
    label_prefix: String,
    binary: String,
    command_timeout: Duration,
}

impl ComposeSource {
    /// Creates a source over the given compose files.
    #[must_use]
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            env_file: None,
            project: None,
            label_prefix: crate::docker::DEFAULT_LABEL_PREFIX.to_string(),
            binary: "docker".to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the env file used for variable substitution.
    #[must_use]
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Sets the compose project name explicitly.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Sets the gateway label prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }

    /// Builds the substitution environment: env file first, process
    /// environment wins.
    fn load_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(path) = &self.env_file {
            match std::fs::read_to_string(path) {
                Ok(contents) => env.extend(parse_env_file(&contents)),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read env file"),
            }
        }
        env.extend(std::env::vars());
        env
    }

    /// Loads, substitutes, parses, and merges the configured compose files.
    fn load_merged(&self) -> Result<ComposeFile> {
        let env = self.load_env();
        let mut parsed = Vec::new();
        for path in &self.files {
            let raw = std::fs::read_to_string(path)?;
            let substituted = substitute_vars(&raw, &env);
            let file: ComposeFile = serde_yaml::from_str(&substituted).map_err(|e| {
                DiscoveryError::Parse(format!("compose file {}: {e}", path.display()))
            })?;
            parsed.push(file);
        }
        Ok(merge_files(parsed))
    }

    /// Project name: explicit config, else the first file's directory name,
    /// as the compose CLI infers it.
    fn project_name(&self) -> Option<String> {
        if let Some(project) = &self.project {
            return Some(project.clone());
        }
        self.files
            .first()
            .and_then(|f| f.parent())
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl DiscoverySource for ComposeSource {
    fn name(&self) -> &str {
        "compose"
    }

    async fn discover(&self) -> Result<ServiceMap> {
        let merged = self.load_merged()?;
        if merged.services.is_empty() {
            return Ok(HashMap::new());
        }

        let project = self.project_name().ok_or_else(|| {
            DiscoveryError::Source("cannot determine compose project name".to_string())
        })?;

        let filter = format!("label={PROJECT_LABEL}={project}");
        let ps = run_docker(
            &self.binary,
            &["ps", "--filter", &filter, "--format", "{{.ID}}"],
            self.command_timeout,
        )
        .await?;

        let ids: Vec<&str> = ps.lines().filter(|l| !l.trim().is_empty()).collect();
        if ids.is_empty() {
            debug!(project = %project, "No running compose containers");
            return Ok(HashMap::new());
        }

        let mut args = vec!["inspect"];
        args.extend(ids.iter().copied());
        let inspect = run_docker(&self.binary, &args, self.command_timeout).await?;
        let containers: Vec<crate::docker::ContainerInspect> = serde_json::from_str(&inspect)
            .map_err(|e| DiscoveryError::Parse(format!("docker inspect output: {e}")))?;

        let mut instances = Vec::new();
        for container in &containers {
            let labels = &container.config.labels;
            let Some(service_name) = labels.get(SERVICE_LABEL) else {
                continue;
            };
            let Some(declared) = merged.services.get(service_name) else {
                continue;
            };

            let short_id: String = container.id.chars().take(12).collect();
            let compose_labels = declared.label_map();

            let port = labels
                .get(&format!("{}.port", self.label_prefix))
                .or_else(|| compose_labels.get(&format!("{}.port", self.label_prefix)))
                .and_then(|p| p.parse::<u16>().ok())
                .or_else(|| declared.container_port());
            let Some(port) = port else {
                warn!(
                    service = %service_name,
                    container = %short_id,
                    "Skipping compose service without a resolvable port"
                );
                continue;
            };

            let address = container
                .network_settings
                .networks
                .values()
                .map(|n| n.ip_address.clone())
                .find(|ip| !ip.is_empty());
            let Some(address) = address else {
                warn!(
                    service = %service_name,
                    container = %short_id,
                    "Skipping compose container without a network address"
                );
                continue;
            };

            let scheme = compose_labels
                .get(&format!("{}.scheme", self.label_prefix))
                .or_else(|| labels.get(&format!("{}.scheme", self.label_prefix)))
                .map_or(Scheme::Http, |s| Scheme::parse_lossy(s));

            let mut builder =
                ServiceInstance::builder(short_id, service_name.clone(), address, port)
                    .scheme(scheme);

            if let Some(path) = compose_labels.get(&format!("{}.health", self.label_prefix)) {
                builder = builder.metadata("health_path", path.clone());
            }

            let meta_prefix = format!("{}.meta.", self.label_prefix);
            for (key, value) in compose_labels.iter().chain(labels.iter()) {
                if let Some(stripped) = key.strip_prefix(&meta_prefix) {
                    builder = builder.metadata(stripped.to_string(), value.clone());
                }
            }

            instances.push(builder.build());
        }

        debug!(
            project = %project,
            instances = instances.len(),
            "Compose discovery pass complete"
        );
        Ok(crate::docker::DockerSource::group_instances(instances))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    // ==================== Substitution Tests ====================

    #[test]
    fn test_substitute_braced() {
        let out = substitute_vars("port: ${API_PORT}", &env(&[("API_PORT", "8080")]));
        assert_eq!(out, "port: 8080");
    }

    #[test]
    fn test_substitute_bare() {
        let out = substitute_vars("host: $HOST", &env(&[("HOST", "db")]));
        assert_eq!(out, "host: db");
    }

    #[test]
    fn test_substitute_unknown_becomes_empty() {
        let out = substitute_vars("value: ${MISSING}", &env(&[]));
        assert_eq!(out, "value: ");
    }

    #[test]
    fn test_substitute_mixed() {
        let out = substitute_vars(
            "${A}-$B-${C}",
            &env(&[("A", "1"), ("B", "2"), ("C", "3")]),
        );
        assert_eq!(out, "1-2-3");
    }

    #[test]
    fn test_substitute_leaves_plain_text() {
        let out = substitute_vars("no variables here", &env(&[]));
        assert_eq!(out, "no variables here");
    }

    // ==================== Env File Tests ====================

    #[test]
    fn test_parse_env_file() {
        let parsed = parse_env_file("# comment\nA=1\n\nB = two \n");
        assert_eq!(parsed.get("A"), Some(&"1".to_string()));
        assert_eq!(parsed.get("B"), Some(&"two".to_string()));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_env_file_skips_malformed() {
        let parsed = parse_env_file("JUSTAKEY\nA=1");
        assert_eq!(parsed.len(), 1);
    }

    // ==================== Compose Parse Tests ====================

    #[test]
    fn test_parse_compose_with_label_list() {
        let yaml = r"
services:
  api:
    image: api:latest
    ports:
      - '8080:80'
    labels:
      - gateway.scheme=https
";
        let file: ComposeFile = serde_yaml::from_str(yaml).ok().unwrap();
        let api = file.services.get("api").unwrap();
        assert_eq!(api.container_port(), Some(80));
        assert_eq!(
            api.label_map().get("gateway.scheme"),
            Some(&"https".to_string())
        );
    }

    #[test]
    fn test_parse_compose_with_label_map() {
        let yaml = r#"
services:
  api:
    ports:
      - 9090
    labels:
      gateway.health: "/healthz"
"#;
        let file: ComposeFile = serde_yaml::from_str(yaml).ok().unwrap();
        let api = file.services.get("api").unwrap();
        assert_eq!(api.container_port(), Some(9090));
        assert_eq!(
            api.label_map().get("gateway.health"),
            Some(&"/healthz".to_string())
        );
    }

    // ==================== Port Entry Tests ====================

    #[test]
    fn test_port_entry_forms() {
        assert_eq!(PortEntry::Number(80).container_port(), Some(80));
        assert_eq!(
            PortEntry::Mapping("8080:80".to_string()).container_port(),
            Some(80)
        );
        assert_eq!(
            PortEntry::Mapping("80/tcp".to_string()).container_port(),
            Some(80)
        );
        assert_eq!(
            PortEntry::Mapping("127.0.0.1:8080:443/tcp".to_string()).container_port(),
            Some(443)
        );
        assert_eq!(PortEntry::Mapping("junk".to_string()).container_port(), None);
    }

    // ==================== Merge Tests ====================

    #[test]
    fn test_merge_later_file_wins() {
        let base: ComposeFile = serde_yaml::from_str(
            "services:\n  api:\n    image: api:1\n    ports: ['80']\n",
        )
        .ok()
        .unwrap();
        let overlay: ComposeFile =
            serde_yaml::from_str("services:\n  api:\n    image: api:2\n").ok().unwrap();

        let merged = merge_files(vec![base, overlay]);
        let api = merged.services.get("api").unwrap();
        assert_eq!(api.image.as_deref(), Some("api:2"));
        // Overlay had no ports: base ports survive.
        assert_eq!(api.container_port(), Some(80));
    }

    #[test]
    fn test_merge_adds_new_services() {
        let base: ComposeFile =
            serde_yaml::from_str("services:\n  api: {}\n").ok().unwrap();
        let overlay: ComposeFile =
            serde_yaml::from_str("services:\n  worker: {}\n").ok().unwrap();

        let merged = merge_files(vec![base, overlay]);
        assert_eq!(merged.services.len(), 2);
    }

    // ==================== Project Name Tests ====================

    #[test]
    fn test_project_name_explicit() {
        let source = ComposeSource::new(vec![PathBuf::from("/tmp/stack/docker-compose.yml")])
            .with_project("myproj");
        assert_eq!(source.project_name(), Some("myproj".to_string()));
    }

    #[test]
    fn test_project_name_from_directory() {
        let source = ComposeSource::new(vec![PathBuf::from("/tmp/stack/docker-compose.yml")]);
        assert_eq!(source.project_name(), Some("stack".to_string()));
    }
}
