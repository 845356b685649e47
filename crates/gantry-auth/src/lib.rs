//! # gantry-auth
//!
//! Role-based access control for the gateway: named policies holding roles
//! (with inheritance) and subject bindings, a bounded TTL cache over
//! permission decisions, and the [`PolicyStore`] the RBAC middleware
//! queries per request.
//!
//! Permission strings use the `resource:action` shape with `*` wildcards on
//! either side. Role inheritance must form a DAG; cycles are rejected when
//! a policy is loaded, before any mutation takes effect.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod cache;
pub mod error;
pub mod policy;

pub use access::{action_for_method, AccessDecision, EnforcementMode, PolicyStore};
pub use cache::PermissionCache;
pub use error::{AuthError, Result};
pub use policy::{Permission, Policy, Role};
