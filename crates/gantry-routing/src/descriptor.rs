//! OpenAPI-3.x route descriptors.
//!
//! A descriptor contributes one rule per operation. The backend service is
//! taken from the operation's `x-gateway.service_name`, falling back to the
//! `x-service` of the operation's first tag; operations with neither are
//! skipped. Path templates (`{param}`) become named pattern parameters.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use tracing::warn;

use gantry_balance::StrategyKind;

use crate::rule::RuleSpec;

/// A parsed OpenAPI descriptor, reduced to what routing consumes.
#[derive(Debug, Deserialize, Default)]
pub struct OpenApiDescriptor {
    /// Spec version marker (unused beyond logging).
    #[serde(default)]
    pub openapi: String,
    /// Tag declarations; `x-service` maps a tag to a backend service.
    #[serde(default)]
    pub tags: Vec<TagObject>,
    /// Path items, kept ordered so rule registration is deterministic.
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
}

/// A tag declaration.
#[derive(Debug, Deserialize)]
pub struct TagObject {
    /// Tag name.
    pub name: String,
    /// Backend service for operations carrying this tag.
    #[serde(rename = "x-service", default)]
    pub service: Option<String>,
}

/// The per-path operation set.
#[derive(Debug, Deserialize, Default)]
pub struct PathItem {
    /// GET operation.
    #[serde(default)]
    pub get: Option<Operation>,
    /// PUT operation.
    #[serde(default)]
    pub put: Option<Operation>,
    /// POST operation.
    #[serde(default)]
    pub post: Option<Operation>,
    /// DELETE operation.
    #[serde(default)]
    pub delete: Option<Operation>,
    /// PATCH operation.
    #[serde(default)]
    pub patch: Option<Operation>,
    /// HEAD operation.
    #[serde(default)]
    pub head: Option<Operation>,
    /// OPTIONS operation.
    #[serde(default)]
    pub options: Option<Operation>,
}

impl PathItem {
    fn operations(&self) -> Vec<(&'static str, &Operation)> {
        let mut ops = Vec::new();
        let pairs: [(&'static str, &Option<Operation>); 7] = [
            ("GET", &self.get),
            ("PUT", &self.put),
            ("POST", &self.post),
            ("DELETE", &self.delete),
            ("PATCH", &self.patch),
            ("HEAD", &self.head),
            ("OPTIONS", &self.options),
        ];
        for (method, op) in pairs {
            if let Some(op) = op {
                ops.push((method, op));
            }
        }
        ops
    }
}

/// One operation.
#[derive(Debug, Deserialize, Default)]
pub struct Operation {
    /// Operation tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Operation id, used as the rule id when present.
    #[serde(rename = "operationId", default)]
    pub operation_id: Option<String>,
    /// Gateway extension.
    #[serde(rename = "x-gateway", default)]
    pub gateway: Option<XGateway>,
}

/// The `x-gateway` operation extension.
#[derive(Debug, Deserialize, Default)]
pub struct XGateway {
    /// Backend service name.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Load-balance strategy.
    #[serde(default)]
    pub load_balance: Option<StrategyKind>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Requests per second hint, carried as rule metadata.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    /// Whether the route requires an authenticated subject.
    #[serde(default)]
    pub auth_required: Option<bool>,
    /// Scopes required by the route, carried as rule metadata.
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Opaque transformation descriptors, carried as rule metadata.
    #[serde(default)]
    pub transformations: Option<serde_json::Value>,
}

impl OpenApiDescriptor {
    /// Parses a descriptor from YAML or JSON text.
    ///
    /// # Errors
    ///
    /// Returns the YAML parser's message when both formats fail (YAML is a
    /// superset of JSON, so it is the authoritative attempt).
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_yaml::from_str(text).map_err(|e| format!("descriptor parse failed: {e}"))
    }

    /// Converts `{param}` path templates to pattern parameters.
    #[must_use]
    pub fn template_to_pattern(template: &str) -> String {
        template
            .split('/')
            .map(|segment| {
                segment
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .map_or_else(|| segment.to_string(), |name| format!(":{name}"))
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn tag_services(&self) -> HashMap<&str, &str> {
        self.tags
            .iter()
            .filter_map(|tag| {
                tag.service
                    .as_deref()
                    .map(|service| (tag.name.as_str(), service))
            })
            .collect()
    }

    /// Produces the rule specs this descriptor declares.
    #[must_use]
    pub fn to_rule_specs(&self) -> Vec<RuleSpec> {
        let tag_services = self.tag_services();
        let mut specs = Vec::new();

        for (template, item) in &self.paths {
            let pattern = Self::template_to_pattern(template);

            for (method, operation) in item.operations() {
                let gateway = operation.gateway.as_ref();
                let service_name = gateway
                    .and_then(|g| g.service_name.clone())
                    .or_else(|| {
                        operation
                            .tags
                            .iter()
                            .find_map(|tag| tag_services.get(tag.as_str()))
                            .map(|s| (*s).to_string())
                    });

                let Some(service_name) = service_name else {
                    warn!(
                        path = %template,
                        method,
                        "Skipping descriptor operation without a service binding"
                    );
                    continue;
                };

                let id = operation.operation_id.clone().unwrap_or_else(|| {
                    format!(
                        "{}-{}",
                        method.to_lowercase(),
                        template.trim_matches('/').replace(['/', '{', '}'], "-")
                    )
                });

                let mut metadata = HashMap::new();
                if let Some(gateway) = gateway {
                    if let Some(rate_limit) = gateway.rate_limit {
                        metadata.insert("rate_limit".to_string(), rate_limit.to_string());
                    }
                    if let Some(auth) = gateway.auth_required {
                        metadata.insert("auth_required".to_string(), auth.to_string());
                    }
                    if !gateway.required_scopes.is_empty() {
                        metadata.insert(
                            "required_scopes".to_string(),
                            gateway.required_scopes.join(","),
                        );
                    }
                    if let Some(transformations) = &gateway.transformations {
                        metadata.insert(
                            "transformations".to_string(),
                            transformations.to_string(),
                        );
                    }
                }

                specs.push(RuleSpec {
                    id,
                    path: pattern.clone(),
                    methods: vec![method.to_string()],
                    service_name,
                    load_balance: gateway
                        .and_then(|g| g.load_balance)
                        .unwrap_or_default(),
                    timeout: gateway.and_then(|g| g.timeout),
                    session_affinity: None,
                    protocol: crate::rule::ProtocolHint::Auto,
                    metadata,
                });
            }
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
openapi: "3.0.3"
tags:
  - name: users
    x-service: user-service
  - name: misc
paths:
  /api/users:
    get:
      operationId: listUsers
      tags: [users]
    post:
      tags: [users]
      x-gateway:
        service_name: user-write-service
        load_balance: least_connections
        timeout: 15
        rate_limit: 100
        auth_required: true
        required_scopes: [users:write]
  /api/users/{id}:
    get:
      operationId: getUser
      tags: [users]
  /api/orphan:
    get:
      tags: [misc]
"#;

    // ==================== Template Tests ====================

    #[test]
    fn test_template_to_pattern() {
        assert_eq!(
            OpenApiDescriptor::template_to_pattern("/api/users/{id}"),
            "/api/users/:id"
        );
        assert_eq!(
            OpenApiDescriptor::template_to_pattern("/a/{x}/b/{y}"),
            "/a/:x/b/:y"
        );
        assert_eq!(
            OpenApiDescriptor::template_to_pattern("/plain/path"),
            "/plain/path"
        );
    }

    // ==================== Conversion Tests ====================

    #[test]
    fn test_parse_and_convert() {
        let descriptor = OpenApiDescriptor::parse(DESCRIPTOR).ok().unwrap();
        let specs = descriptor.to_rule_specs();

        // Orphan operation (tag without x-service) is skipped.
        assert_eq!(specs.len(), 3);

        let list = specs.iter().find(|s| s.id == "listUsers").unwrap();
        assert_eq!(list.service_name, "user-service");
        assert_eq!(list.methods, vec!["GET"]);
        assert_eq!(list.path, "/api/users");

        let get_user = specs.iter().find(|s| s.id == "getUser").unwrap();
        assert_eq!(get_user.path, "/api/users/:id");
    }

    #[test]
    fn test_x_gateway_overrides_tag_service() {
        let descriptor = OpenApiDescriptor::parse(DESCRIPTOR).ok().unwrap();
        let specs = descriptor.to_rule_specs();

        let post = specs
            .iter()
            .find(|s| s.methods == vec!["POST"])
            .unwrap();
        assert_eq!(post.service_name, "user-write-service");
        assert_eq!(post.load_balance, StrategyKind::LeastConnections);
        assert_eq!(post.timeout, Some(15));
        assert_eq!(post.metadata.get("rate_limit"), Some(&"100".to_string()));
        assert_eq!(post.metadata.get("auth_required"), Some(&"true".to_string()));
        assert_eq!(
            post.metadata.get("required_scopes"),
            Some(&"users:write".to_string())
        );
    }

    #[test]
    fn test_generated_rule_id() {
        let yaml = r"
paths:
  /api/files/{name}:
    delete:
      x-gateway:
        service_name: file-service
";
        let descriptor = OpenApiDescriptor::parse(yaml).ok().unwrap();
        let specs = descriptor.to_rule_specs();
        assert_eq!(specs[0].id, "delete-api-files--name-");
    }

    #[test]
    fn test_parse_json_form() {
        let json = r#"{
            "openapi": "3.0.0",
            "paths": {
                "/p": {
                    "get": {"x-gateway": {"service_name": "svc"}}
                }
            }
        }"#;
        let descriptor = OpenApiDescriptor::parse(json).ok().unwrap();
        assert_eq!(descriptor.to_rule_specs().len(), 1);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(OpenApiDescriptor::parse(": not yaml: [").is_err());
    }

    #[test]
    fn test_specs_convert_to_rules() {
        let descriptor = OpenApiDescriptor::parse(DESCRIPTOR).ok().unwrap();
        for spec in descriptor.to_rule_specs() {
            assert!(spec.into_rule().is_ok());
        }
    }
}
