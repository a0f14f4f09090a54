//! Per-request view of who is acting and with which roles
use std::collections::BTreeSet;

use serde::Deserialize;

use crate::error::AuthzError;
use crate::market::Member;
use crate::rbac::CompiledPermissionGraph;

/// Synthetic roles injected from the request context.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionRoles {
    /// Substituted for every role when there is no session.
    pub guest_role: String,
    /// Added next to the session's own roles; `None` disables the marker.
    pub authenticated_role: Option<String>,
}

/// An authenticated session as handed over by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    user_id: Option<String>,
    roles: BTreeSet<String>,
}

impl Default for SessionRoles {
    fn default() -> Self {
        Self {
            guest_role: "guest".to_owned(),
            authenticated_role: Some("authenticated".to_owned()),
        }
    }
}

impl Session {
    pub fn for_member(member: &Member) -> Self {
        Self {
            user_id: member.user_id.clone(),
            roles: member.roles.clone(),
        }
    }
}

impl Actor {
    pub fn from_session(session: Option<&Session>, config: &SessionRoles) -> Self {
        match session {
            None => Self::guest(config),
            Some(session) => {
                let mut roles: BTreeSet<String> = session.roles.iter().cloned().collect();
                if let Some(marker) = &config.authenticated_role {
                    roles.insert(marker.clone());
                }
                Self {
                    user_id: Some(session.user_id.clone()),
                    roles,
                }
            }
        }
    }

    pub fn guest(config: &SessionRoles) -> Self {
        Self {
            user_id: None,
            roles: BTreeSet::from([config.guest_role.clone()]),
        }
    }

    /// Actor with exactly the given roles and no injected marker.
    pub fn user<I, S>(user_id: &str, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: Some(user_id.to_owned()),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn authorize(
        &self,
        compiled: &CompiledPermissionGraph,
        required: &BTreeSet<String>,
    ) -> Result<(), AuthzError> {
        compiled.authorize(&self.roles, required)
    }

    pub fn probe(&self, compiled: &CompiledPermissionGraph, required: &BTreeSet<String>) -> bool {
        compiled.probe(&self.roles, required)
    }
}
