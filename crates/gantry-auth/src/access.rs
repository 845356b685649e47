//! The policy store and access decisions.

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::PermissionCache;
use crate::error::{AuthError, Result};
use crate::policy::Policy;

/// How a denial is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Denials are returned to the caller.
    #[default]
    Enforce,
    /// Denials are logged and the request passes.
    Permissive,
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The subject may proceed.
    Allowed,
    /// The subject is denied; carries the reason.
    Denied(String),
    /// No subject was established on the request.
    Unauthenticated,
}

/// Maps a request method to the action side of a permission check.
#[must_use]
pub fn action_for_method(method: &str) -> String {
    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" => "read".to_string(),
        "POST" => "create".to_string(),
        "PUT" | "PATCH" => "update".to_string(),
        "DELETE" => "delete".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Holds the loaded policies and answers permission checks through the
/// bounded cache.
///
/// Every policy mutation clears the cache; a subject-targeted unbind clears
/// only that subject's entries.
#[derive(Debug)]
pub struct PolicyStore {
    policies: RwLock<std::collections::HashMap<String, Policy>>,
    cache: PermissionCache,
    mode: EnforcementMode,
    default_allow: bool,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// Creates an empty store in enforce mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(std::collections::HashMap::new()),
            cache: PermissionCache::default(),
            mode: EnforcementMode::Enforce,
            default_allow: false,
        }
    }

    /// Sets the enforcement mode.
    #[must_use]
    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    /// Allows requests whose subject matches no permission.
    #[must_use]
    pub fn with_default_allow(mut self, default_allow: bool) -> Self {
        self.default_allow = default_allow;
        self
    }

    /// Replaces the cache bounds.
    #[must_use]
    pub fn with_cache(mut self, ttl: Duration, max_entries: usize) -> Self {
        self.cache = PermissionCache::new(ttl, max_entries);
        self
    }

    /// The enforcement mode.
    #[must_use]
    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    /// Number of loaded policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    /// True when no policies are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    /// Adds a policy after validating it; clears the cache.
    pub fn add_policy(&self, policy: Policy) -> Result<()> {
        policy.validate()?;
        let name = policy.name.clone();
        self.policies.write().insert(name.clone(), policy);
        self.cache.clear();
        debug!(policy = %name, "Added rbac policy");
        Ok(())
    }

    /// Removes a policy; clears the cache.
    pub fn remove_policy(&self, name: &str) -> Result<()> {
        self.policies
            .write()
            .remove(name)
            .ok_or_else(|| AuthError::PolicyNotFound(name.to_string()))?;
        self.cache.clear();
        debug!(policy = name, "Removed rbac policy");
        Ok(())
    }

    /// Replaces every policy at once; clears the cache.
    pub fn reload(&self, policies: Vec<Policy>) -> Result<()> {
        for policy in &policies {
            policy.validate()?;
        }
        let mut loaded = std::collections::HashMap::new();
        for policy in policies {
            loaded.insert(policy.name.clone(), policy);
        }
        *self.policies.write() = loaded;
        self.cache.clear();
        Ok(())
    }

    /// Binds `subject` to `role` inside `policy`; clears the cache.
    pub fn bind_role(&self, policy: &str, subject: &str, role: &str) -> Result<()> {
        {
            let mut policies = self.policies.write();
            let policy = policies
                .get_mut(policy)
                .ok_or_else(|| AuthError::PolicyNotFound(policy.to_string()))?;
            if !policy.roles.contains_key(role) {
                return Err(AuthError::UndefinedRole {
                    policy: policy.name.clone(),
                    role: role.to_string(),
                });
            }
            let bound = policy.bindings.entry(subject.to_string()).or_default();
            if !bound.iter().any(|r| r == role) {
                bound.push(role.to_string());
            }
        }
        self.cache.clear();
        Ok(())
    }

    /// Unbinds `subject` from `role`; clears only that subject's cache
    /// entries.
    pub fn unbind_role(&self, policy: &str, subject: &str, role: &str) -> Result<()> {
        {
            let mut policies = self.policies.write();
            let policy = policies
                .get_mut(policy)
                .ok_or_else(|| AuthError::PolicyNotFound(policy.to_string()))?;
            let bound = policy.bindings.get_mut(subject).ok_or_else(|| {
                AuthError::BindingNotFound {
                    policy: policy.name.clone(),
                    subject: subject.to_string(),
                }
            })?;
            bound.retain(|r| r != role);
            if bound.is_empty() {
                policy.bindings.remove(subject);
            }
        }
        self.cache.clear_subject(subject);
        Ok(())
    }

    /// Answers `subject may perform action on resource`, through the cache.
    #[must_use]
    pub fn has_permission(&self, subject: &str, resource: &str, action: &str) -> bool {
        let key = PermissionCache::key(subject, resource, action);
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let allowed = self
            .policies
            .read()
            .values()
            .any(|policy| policy.allows(subject, resource, action));

        self.cache.insert(key, allowed);
        allowed
    }

    /// Full access decision honoring enforcement mode and default-allow.
    #[must_use]
    pub fn decide(
        &self,
        subject: Option<&str>,
        resource: &str,
        action: &str,
    ) -> AccessDecision {
        let Some(subject) = subject else {
            if self.mode == EnforcementMode::Permissive {
                debug!(resource, action, "Permissive mode: passing unauthenticated request");
                return AccessDecision::Allowed;
            }
            return AccessDecision::Unauthenticated;
        };

        if self.has_permission(subject, resource, action) {
            return AccessDecision::Allowed;
        }

        if self.default_allow {
            debug!(subject, resource, action, "Default-allow: passing unmatched request");
            return AccessDecision::Allowed;
        }

        if self.mode == EnforcementMode::Permissive {
            warn!(subject, resource, action, "Permissive mode: passing denied request");
            return AccessDecision::Allowed;
        }

        AccessDecision::Denied(format!(
            "subject '{subject}' lacks permission {resource}:{action}"
        ))
    }

    /// The cache, exposed for observability.
    #[must_use]
    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Role;
    use test_case::test_case;

    fn store() -> PolicyStore {
        let store = PolicyStore::new();
        let policy = Policy::new("main")
            .with_role("admin", Role::new().with_permission("*:*").ok().unwrap())
            .with_role(
                "viewer",
                Role::new().with_permission("*:read").ok().unwrap(),
            )
            .with_binding("user1", "admin")
            .with_binding("viewer1", "viewer");
        store.add_policy(policy).ok();
        store
    }

    // ==================== Action Mapping Tests ====================

    #[test_case("GET", "read")]
    #[test_case("HEAD", "read")]
    #[test_case("POST", "create")]
    #[test_case("PUT", "update")]
    #[test_case("PATCH", "update")]
    #[test_case("DELETE", "delete")]
    #[test_case("OPTIONS", "options")]
    fn test_action_for_method(method: &str, expected: &str) {
        assert_eq!(action_for_method(method), expected);
    }

    // ==================== Permission Check Tests ====================

    #[test]
    fn test_admin_wildcard() {
        let store = store();
        assert!(store.has_permission("user1", "anything", "anything"));
        assert!(store.has_permission("user1", "nodes", "delete"));
    }

    #[test]
    fn test_viewer_read_only() {
        let store = store();
        assert!(store.has_permission("viewer1", "anything", "read"));
        assert!(!store.has_permission("viewer1", "x", "write"));
    }

    #[test]
    fn test_consecutive_calls_agree() {
        let store = store();
        let first = store.has_permission("viewer1", "docs", "read");
        let second = store.has_permission("viewer1", "docs", "read");
        assert_eq!(first, second);
        // Second call was served by the cache.
        assert!(store.cache().len() >= 1);
    }

    // ==================== Cache Invalidation Tests ====================

    #[test]
    fn test_add_policy_clears_cache() {
        let store = store();
        store.has_permission("viewer1", "docs", "read");
        assert!(!store.cache().is_empty());

        store
            .add_policy(Policy::new("extra"))
            .ok();
        assert!(store.cache().is_empty());
    }

    #[test]
    fn test_remove_policy_clears_cache() {
        let store = store();
        store.has_permission("viewer1", "docs", "read");
        store.remove_policy("main").ok();
        assert!(store.cache().is_empty());
        assert!(!store.has_permission("user1", "x", "y"));
    }

    #[test]
    fn test_bind_role_changes_answer() {
        let store = store();
        assert!(!store.has_permission("newcomer", "docs", "read"));

        store.bind_role("main", "newcomer", "viewer").ok();
        // Stale negative answer must not survive the mutation.
        assert!(store.has_permission("newcomer", "docs", "read"));
    }

    #[test]
    fn test_unbind_role_clears_subject_only() {
        let store = store();
        store.has_permission("viewer1", "docs", "read");
        store.has_permission("user1", "docs", "read");
        let before = store.cache().len();
        assert!(before >= 2);

        store.unbind_role("main", "viewer1", "viewer").ok();

        // user1's entries survive; viewer1's are gone and re-evaluate to
        // denied.
        assert!(store.cache().len() < before);
        assert!(!store.has_permission("viewer1", "docs", "read"));
        assert!(store.has_permission("user1", "docs", "read"));
    }

    #[test]
    fn test_reload_replaces_and_clears() {
        let store = store();
        store.has_permission("user1", "docs", "read");

        let replacement = Policy::new("other")
            .with_role("viewer", Role::new().with_permission("*:read").ok().unwrap())
            .with_binding("bob", "viewer");
        store.reload(vec![replacement]).ok();

        assert_eq!(store.len(), 1);
        assert!(!store.has_permission("user1", "docs", "read"));
        assert!(store.has_permission("bob", "docs", "read"));
    }

    #[test]
    fn test_reload_rejects_invalid_policy_atomically() {
        let store = store();
        let broken = Policy::new("broken")
            .with_role("a", Role::new().inheriting("a"));

        assert!(store.reload(vec![broken]).is_err());
        // Original policies untouched.
        assert!(store.has_permission("user1", "x", "y"));
    }

    #[test]
    fn test_bind_unknown_role_fails() {
        let store = store();
        let result = store.bind_role("main", "x", "ghost");
        assert!(matches!(result, Err(AuthError::UndefinedRole { .. })));
    }

    // ==================== Decision Tests ====================

    #[test]
    fn test_decide_allowed() {
        let store = store();
        assert_eq!(
            store.decide(Some("user1"), "docs", "delete"),
            AccessDecision::Allowed
        );
    }

    #[test]
    fn test_decide_denied_in_enforce_mode() {
        let store = store();
        assert!(matches!(
            store.decide(Some("viewer1"), "docs", "delete"),
            AccessDecision::Denied(_)
        ));
    }

    #[test]
    fn test_decide_missing_subject_enforce() {
        let store = store();
        assert_eq!(
            store.decide(None, "docs", "read"),
            AccessDecision::Unauthenticated
        );
    }

    #[test]
    fn test_decide_missing_subject_permissive() {
        let store = PolicyStore::new().with_mode(EnforcementMode::Permissive);
        assert_eq!(store.decide(None, "docs", "read"), AccessDecision::Allowed);
    }

    #[test]
    fn test_decide_permissive_passes_denials() {
        let store = store();
        let permissive = PolicyStore::new().with_mode(EnforcementMode::Permissive);
        permissive
            .add_policy(Policy::new("empty"))
            .ok();

        assert!(matches!(
            store.decide(Some("nobody"), "x", "y"),
            AccessDecision::Denied(_)
        ));
        assert_eq!(
            permissive.decide(Some("nobody"), "x", "y"),
            AccessDecision::Allowed
        );
    }

    #[test]
    fn test_decide_default_allow() {
        let store = PolicyStore::new().with_default_allow(true);
        assert_eq!(
            store.decide(Some("anyone"), "x", "y"),
            AccessDecision::Allowed
        );
    }

    #[test]
    fn test_add_invalid_policy_rejected_without_mutation() {
        let store = store();
        let cycle = Policy::new("cycle")
            .with_role("a", Role::new().inheriting("b"))
            .with_role("b", Role::new().inheriting("a"));

        let before = store.len();
        assert!(matches!(
            store.add_policy(cycle),
            Err(AuthError::CircularInheritance { .. })
        ));
        assert_eq!(store.len(), before);
    }
}
