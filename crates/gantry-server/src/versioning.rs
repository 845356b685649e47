//! API versioning middleware.
//!
//! Extracts the requested version from the path (`/v2/...`), a header, a
//! query parameter, or an Accept media-type parameter (`;version=2`).
//! Versions past their removal date are rejected outright; deprecated
//! versions pass but gain deprecation response headers. When the version
//! maps to a service override (explicit mapping or the
//! `<service>-<version>` convention) the router picks it up from context.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gantry_core::context::keys;
use gantry_core::{GatewayError, GatewayRequest, GatewayResponse, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::middleware::Middleware;

static PATH_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/v(\d+(?:\.\d+)?)/").unwrap_or_else(|_| unreachable!()));

/// Per-version behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMapping {
    /// Backend service that serves this version.
    #[serde(default)]
    pub service: Option<String>,
    /// Whether the version is deprecated.
    #[serde(default)]
    pub deprecated: bool,
    /// Message sent with the deprecation headers.
    #[serde(default)]
    pub deprecation_message: Option<String>,
    /// `Sunset` header value for deprecated versions.
    #[serde(default)]
    pub sunset: Option<String>,
    /// Date (`YYYY-MM-DD` or RFC 3339) after which the version is
    /// rejected.
    #[serde(default)]
    pub removal_date: Option<String>,
}

/// Versioning layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersioningConfig {
    /// Header carrying the version.
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Query parameter carrying the version.
    #[serde(default = "default_query_param")]
    pub query_param: String,
    /// Version applied when the request names none.
    #[serde(default)]
    pub default_version: Option<String>,
    /// Prefix template (e.g. `/v{version}`) added to the path when the
    /// version did not arrive via the path.
    #[serde(default)]
    pub add_prefix: Option<String>,
    /// Use the `<service>-<version>` naming convention when no explicit
    /// mapping names a service.
    #[serde(default)]
    pub suffix_services: bool,
    /// Per-version behavior.
    #[serde(default)]
    pub mappings: HashMap<String, VersionMapping>,
}

fn default_header_name() -> String {
    "X-API-Version".to_string()
}

fn default_query_param() -> String {
    "version".to_string()
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            header_name: default_header_name(),
            query_param: default_query_param(),
            default_version: None,
            add_prefix: None,
            suffix_services: false,
            mappings: HashMap::new(),
        }
    }
}

fn set_header(response: &mut GatewayResponse, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        http::header::HeaderName::try_from(name),
        http::header::HeaderValue::try_from(value),
    ) {
        response.headers.insert(name, value);
    }
}

/// Where a version was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionOrigin {
    Path,
    Header,
    Query,
    Accept,
    Default,
}

/// The versioning middleware.
#[derive(Debug)]
pub struct VersioningLayer {
    config: VersioningConfig,
}

impl VersioningLayer {
    /// Creates the layer.
    #[must_use]
    pub fn new(config: VersioningConfig) -> Self {
        Self { config }
    }

    fn extract(&self, request: &GatewayRequest) -> Option<(String, VersionOrigin)> {
        if let Some(captures) = PATH_VERSION.captures(&request.path) {
            if let Some(version) = captures.get(1) {
                return Some((version.as_str().to_string(), VersionOrigin::Path));
            }
        }
        if let Some(version) = request.header(&self.config.header_name) {
            return Some((version.to_string(), VersionOrigin::Header));
        }
        if let Some(version) = request.query_param(&self.config.query_param) {
            return Some((version, VersionOrigin::Query));
        }
        if let Some(accept) = request.header(http::header::ACCEPT.as_str()) {
            for param in accept.split(';') {
                if let Some(version) = param.trim().strip_prefix("version=") {
                    return Some((version.to_string(), VersionOrigin::Accept));
                }
            }
        }
        self.config
            .default_version
            .clone()
            .map(|version| (version, VersionOrigin::Default))
    }

    fn removal_passed(mapping: &VersionMapping) -> bool {
        let Some(raw) = &mapping.removal_date else {
            return false;
        };
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
            return timestamp.with_timezone(&Utc) <= Utc::now();
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            let midnight = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
            return midnight.is_some_and(|dt| dt <= Utc::now());
        }
        false
    }
}

#[async_trait]
impl Middleware for VersioningLayer {
    fn name(&self) -> &str {
        "versioning"
    }

    async fn on_request(&self, request: &mut GatewayRequest) -> Result<()> {
        let Some((version, origin)) = self.extract(request) else {
            return Ok(());
        };

        let mapping = self.config.mappings.get(&version);

        if let Some(mapping) = mapping {
            if Self::removal_passed(mapping) {
                return Err(GatewayError::bad_request(format!(
                    "api version {version} has been removed"
                ))
                .with_detail("version", version));
            }
        }

        // Path rewrite: strip an inline version prefix, or add the
        // configured one for versions arriving out-of-band.
        if origin == VersionOrigin::Path {
            let stripped = PATH_VERSION.replace(&request.path, "/").into_owned();
            debug!(from = %request.path, to = %stripped, "Stripped version prefix");
            request.path = stripped;
        } else if let Some(template) = &self.config.add_prefix {
            let prefix = template.replace("{version}", &version);
            request.path = format!("{prefix}{}", request.path);
        }

        if let Some(service) = mapping.and_then(|m| m.service.clone()) {
            request.context.insert(keys::VERSION_SERVICE, service);
        } else if self.config.suffix_services {
            request.context.insert(keys::VERSION_SUFFIX, version.clone());
        }

        request.context.insert(keys::VERSION, version);
        Ok(())
    }

    fn on_response(&self, request: &GatewayRequest, response: &mut GatewayResponse) {
        let Some(version) = request.context.get(keys::VERSION) else {
            return;
        };
        set_header(response, "X-API-Version", version);

        if let Some(mapping) = self.config.mappings.get(version) {
            if mapping.deprecated {
                set_header(response, "X-API-Deprecated", "true");
                if let Some(message) = &mapping.deprecation_message {
                    set_header(response, "X-API-Deprecation-Message", message);
                }
                if let Some(sunset) = &mapping.sunset {
                    set_header(response, "Sunset", sunset);
                }
            }
        }
    }
}
