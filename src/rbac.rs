//! Role graph compilation and permission resolution.
//!
//! A [`PermissionGraph`] is the static role configuration: declared roles,
//! which roles each one directly inherits from, and which permissions each
//! one is directly granted. Compiling it produces a
//! [`CompiledPermissionGraph`] holding every role's closed permission set,
//! which is what authorization checks run against.
//!
//! Authorization is decided per role. An actor holding roles `A` and `B` is
//! authorized for a requirement only if `A` alone or `B` alone covers all of
//! it; the union of the two is never considered.
use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AuthzError, RbacError};

/// Upper bound on propagation passes before compilation is declared divergent.
pub const DEFAULT_MAX_PASSES: usize = 50;

/// One role as written in configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub grants: BTreeSet<String>,
    #[serde(default)]
    pub inherits: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGraph {
    // role -> readable title; the keys are the declared roles
    titles: BTreeMap<String, String>,
    inheritance: BTreeMap<String, BTreeSet<String>>,
    grants: BTreeMap<String, BTreeSet<String>>,
}

/// Immutable result of compiling a [`PermissionGraph`]. Share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPermissionGraph {
    titles: BTreeMap<String, String>,
    closures: BTreeMap<String, BTreeSet<String>>,
}

/// Build an owned permission set from string literals.
pub fn permission_set<I, S>(permissions: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    permissions.into_iter().map(Into::into).collect()
}

impl PermissionGraph {
    /// Assemble a graph from its three parts. Roles are titled by their name.
    pub fn new(
        roles: impl IntoIterator<Item = String>,
        inheritance: BTreeMap<String, BTreeSet<String>>,
        grants: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            titles: roles.into_iter().map(|r| (r.clone(), r)).collect(),
            inheritance,
            grants,
        }
    }

    pub fn from_specs(specs: Vec<RoleSpec>) -> Result<Self, RbacError> {
        let mut graph = Self::default();

        for spec in specs {
            if graph.titles.contains_key(&spec.name) {
                return Err(RbacError::DuplicateRole(spec.name));
            }
            let title = if spec.title.is_empty() {
                spec.name.clone()
            } else {
                spec.title
            };
            graph.titles.insert(spec.name.clone(), title);
            if !spec.inherits.is_empty() {
                graph.inheritance.insert(spec.name.clone(), spec.inherits);
            }
            if !spec.grants.is_empty() {
                graph.grants.insert(spec.name, spec.grants);
            }
        }

        Ok(graph)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.titles.keys().map(String::as_str)
    }

    fn check_declared(
        &self,
        role: &str,
        context: impl FnOnce() -> String,
    ) -> Result<(), RbacError> {
        if self.titles.contains_key(role) {
            Ok(())
        } else {
            Err(RbacError::InvalidRoleReference {
                referenced: role.to_owned(),
                context: context(),
            })
        }
    }

    /// Every role mentioned anywhere must be declared.
    fn validate(&self) -> Result<(), RbacError> {
        for (role, parents) in &self.inheritance {
            self.check_declared(role, || "the inheritance map".to_owned())?;
            for parent in parents {
                self.check_declared(parent, || format!("the inheritance of `{role}`"))?;
            }
        }
        for role in self.grants.keys() {
            self.check_declared(role, || "the grant map".to_owned())?;
        }
        Ok(())
    }
}

impl CompiledPermissionGraph {
    pub fn compile(graph: &PermissionGraph) -> Result<Self, RbacError> {
        Self::compile_with_limit(graph, DEFAULT_MAX_PASSES)
    }

    pub fn compile_with_limit(
        graph: &PermissionGraph,
        max_passes: usize,
    ) -> Result<Self, RbacError> {
        graph.validate()?;
        let order: Vec<&str> = graph.roles().collect();
        Self::compile_in_order(graph, &order, max_passes)
    }

    // Fixed-point propagation. `order` is the sequence roles are visited in
    // within a pass; the result does not depend on it.
    fn compile_in_order(
        graph: &PermissionGraph,
        order: &[&str],
        max_passes: usize,
    ) -> Result<Self, RbacError> {
        let mut closures: BTreeMap<String, BTreeSet<String>> = order
            .iter()
            .map(|role| {
                let direct = graph.grants.get(*role).cloned().unwrap_or_default();
                (role.to_string(), direct)
            })
            .collect();

        let mut passes = 0;
        loop {
            passes += 1;
            if passes > max_passes {
                return Err(RbacError::CompileDiverged { passes: max_passes });
            }

            let mut grew = false;
            for role in order {
                let inherited: Vec<String> = graph
                    .inheritance
                    .get(*role)
                    .into_iter()
                    .flatten()
                    .filter_map(|parent| closures.get(parent))
                    .flatten()
                    .cloned()
                    .collect();

                let closure = closures.entry(role.to_string()).or_default();
                let before = closure.len();
                closure.extend(inherited);
                grew |= closure.len() > before;
            }

            if !grew {
                break;
            }
        }

        debug!(passes, "rbac permission compilation finished");
        info!(roles = closures.len(), closures = ?closures, "rbac compiled");

        Ok(Self {
            titles: graph.titles.clone(),
            closures,
        })
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.closures.keys().map(String::as_str)
    }

    pub fn title(&self, role: &str) -> Option<&str> {
        self.titles.get(role).map(String::as_str)
    }

    /// Closed permission set of `role`.
    pub fn permissions(&self, role: &str) -> Option<&BTreeSet<String>> {
        self.closures.get(role)
    }

    pub fn check_role(&self, role: &str) -> Result<(), AuthzError> {
        if self.closures.contains_key(role) {
            Ok(())
        } else {
            Err(AuthzError::InvalidRole(role.to_owned()))
        }
    }

    /// Single role, single permission.
    pub fn check_role_has_permission(
        &self,
        role: &str,
        permission: &str,
    ) -> Result<(), AuthzError> {
        self.check_role(role)?;
        if self.closures[role].contains(permission) {
            Ok(())
        } else {
            Err(AuthzError::PermissionDenied {
                roles: permission_set([role]),
                required: permission_set([permission]),
            })
        }
    }

    /// Succeeds when at least one role in `roles` covers all of `required` on
    /// its own.
    pub fn authorize(
        &self,
        roles: &BTreeSet<String>,
        required: &BTreeSet<String>,
    ) -> Result<(), AuthzError> {
        for role in roles {
            self.check_role(role)?;
        }

        if let Some(role) = roles
            .iter()
            .find(|role| self.closures[role.as_str()].is_superset(required))
        {
            debug!(role = %role, ?required, "authorized");
            return Ok(());
        }

        Err(AuthzError::PermissionDenied {
            roles: roles.clone(),
            required: required.clone(),
        })
    }

    /// Non-failing form of [`authorize`](Self::authorize). Unknown roles never match.
    pub fn probe(&self, roles: &BTreeSet<String>, required: &BTreeSet<String>) -> bool {
        roles.iter().any(|role| {
            self.closures
                .get(role)
                .is_some_and(|closure| closure.is_superset(required))
        })
    }
}
