//! # gantry-routing
//!
//! The route table: compiled path patterns, per-rule load balancers, the
//! router that resolves a request to a backend instance, and the dynamic
//! route manager that installs rule sets from descriptor sources.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod descriptor;
pub mod dynamic;
pub mod pattern;
pub mod router;
pub mod rule;

pub use descriptor::OpenApiDescriptor;
pub use dynamic::DynamicRoutes;
pub use pattern::Pattern;
pub use router::{Router, RouteResult, RoutingError};
pub use rule::{ProtocolHint, RouteRule, RouteRuleBuilder, RuleSpec};
