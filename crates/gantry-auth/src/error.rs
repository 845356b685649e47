//! Error types for policy loading and mutation.

use thiserror::Error;

/// Errors that can occur while loading or mutating RBAC policies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// A role inheritance cycle was detected at load time.
    #[error("role '{role}' participates in circular inheritance")]
    CircularInheritance {
        /// A role on the cycle.
        role: String,
    },

    /// A binding or inheritance references a role the policy does not
    /// define.
    #[error("policy '{policy}' references undefined role '{role}'")]
    UndefinedRole {
        /// The policy.
        policy: String,
        /// The missing role.
        role: String,
    },

    /// A permission string does not have the `resource:action` shape.
    #[error("invalid permission '{0}': expected resource:action")]
    InvalidPermission(String),

    /// The named policy is not loaded.
    #[error("policy '{0}' not found")]
    PolicyNotFound(String),

    /// The subject has no binding in the policy.
    #[error("subject '{subject}' has no binding in policy '{policy}'")]
    BindingNotFound {
        /// The policy.
        policy: String,
        /// The subject.
        subject: String,
    },
}

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, AuthError>;
