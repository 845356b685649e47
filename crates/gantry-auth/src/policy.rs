//! Policies, roles, and permission patterns.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

/// A `resource:action` permission pattern.
///
/// Either side may be the `*` wildcard: `*:*` grants everything,
/// `workloads:*` every action on one resource, `*:read` one action
/// everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    resource: String,
    action: String,
}

impl Permission {
    /// Parses a permission string.
    ///
    /// The action is everything after the last colon, so resources may
    /// themselves contain colons (`service:billing:read`).
    pub fn parse(raw: &str) -> Result<Self> {
        let (resource, action) = raw
            .rsplit_once(':')
            .ok_or_else(|| AuthError::InvalidPermission(raw.to_string()))?;
        if resource.is_empty() || action.is_empty() {
            return Err(AuthError::InvalidPermission(raw.to_string()));
        }
        Ok(Self {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }

    /// The resource side.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The action side.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Tests this pattern against a concrete `resource` / `action` pair.
    #[must_use]
    pub fn matches(&self, resource: &str, action: &str) -> bool {
        let resource_matches = self.resource == "*" || self.resource == resource;
        let action_matches = self.action == "*" || self.action == action;
        resource_matches && action_matches
    }
}

impl TryFrom<String> for Permission {
    type Error = AuthError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<Permission> for String {
    fn from(permission: Permission) -> Self {
        permission.to_string()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// A role: a set of permissions plus the roles it inherits.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Role {
    /// Granted permissions.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Roles whose permissions this role also carries.
    #[serde(default)]
    pub inherits: Vec<String>,
}

impl Role {
    /// Creates an empty role.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a permission; invalid strings are rejected.
    pub fn with_permission(mut self, raw: &str) -> Result<Self> {
        self.permissions.push(Permission::parse(raw)?);
        Ok(self)
    }

    /// Adds an inherited role.
    #[must_use]
    pub fn inheriting(mut self, role: impl Into<String>) -> Self {
        self.inherits.push(role.into());
        self
    }
}

/// A named policy: roles plus subject bindings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Policy name; unique within the store.
    pub name: String,
    /// Roles by name.
    #[serde(default)]
    pub roles: HashMap<String, Role>,
    /// Subject to bound role names.
    #[serde(default)]
    pub bindings: HashMap<String, Vec<String>>,
}

impl Policy {
    /// Creates an empty policy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, name: impl Into<String>, role: Role) -> Self {
        self.roles.insert(name.into(), role);
        self
    }

    /// Binds a subject to a role.
    #[must_use]
    pub fn with_binding(mut self, subject: impl Into<String>, role: impl Into<String>) -> Self {
        self.bindings
            .entry(subject.into())
            .or_default()
            .push(role.into());
        self
    }

    /// Validates the policy: bindings and inheritance reference only
    /// defined roles, and the inheritance graph is a DAG.
    pub fn validate(&self) -> Result<()> {
        for roles in self.bindings.values() {
            for role in roles {
                if !self.roles.contains_key(role) {
                    return Err(AuthError::UndefinedRole {
                        policy: self.name.clone(),
                        role: role.clone(),
                    });
                }
            }
        }

        for role in self.roles.values() {
            for inherited in &role.inherits {
                if !self.roles.contains_key(inherited) {
                    return Err(AuthError::UndefinedRole {
                        policy: self.name.clone(),
                        role: inherited.clone(),
                    });
                }
            }
        }

        // Three-color DFS over the inheritance graph.
        let mut finished: HashSet<&str> = HashSet::new();
        for name in self.roles.keys() {
            let mut in_progress: HashSet<&str> = HashSet::new();
            self.check_acyclic(name, &mut in_progress, &mut finished)?;
        }
        Ok(())
    }

    fn check_acyclic<'a>(
        &'a self,
        name: &'a str,
        in_progress: &mut HashSet<&'a str>,
        finished: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if finished.contains(name) {
            return Ok(());
        }
        if !in_progress.insert(name) {
            return Err(AuthError::CircularInheritance {
                role: name.to_string(),
            });
        }
        if let Some(role) = self.roles.get(name) {
            for inherited in &role.inherits {
                self.check_acyclic(inherited, in_progress, finished)?;
            }
        }
        in_progress.remove(name);
        finished.insert(name);
        Ok(())
    }

    /// True when `subject` is bound (directly or through inheritance) to a
    /// permission matching `resource:action`.
    #[must_use]
    pub fn allows(&self, subject: &str, resource: &str, action: &str) -> bool {
        let Some(bound) = self.bindings.get(subject) else {
            return false;
        };

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = bound.iter().map(String::as_str).collect();

        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            let Some(role) = self.roles.get(name) else {
                continue;
            };
            if role
                .permissions
                .iter()
                .any(|p| p.matches(resource, action))
            {
                return true;
            }
            stack.extend(role.inherits.iter().map(String::as_str));
        }
        false
    }
}
