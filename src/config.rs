//! TOML configuration for the trading core.
//!
//! Every section is optional; an empty document yields the built-in role set
//! and default limits.
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::actor::SessionRoles;
use crate::logging::LogFormat;
use crate::rbac::{CompiledPermissionGraph, PermissionGraph, RoleSpec};
use crate::service::TradeSettings;

fn default_log_level() -> String {
    "info".to_owned()
}

fn role(name: &str, title: &str, grants: &[&str], inherits: &[&str]) -> RoleSpec {
    RoleSpec {
        name: name.to_owned(),
        title: title.to_owned(),
        grants: grants.iter().map(|g| (*g).to_owned()).collect(),
        inherits: inherits.iter().map(|r| (*r).to_owned()).collect(),
    }
}

fn default_roles() -> Vec<RoleSpec> {
    vec![
        role("guest", "Guest", &["item:browse"], &[]),
        role("authenticated", "Signed in", &["notification:read"], &["guest"]),
        role(
            "member",
            "Campus member",
            &[
                "trade:start",
                "trade:accept",
                "trade:cancel",
                "trade:confirm",
                "notification:send",
            ],
            &["authenticated"],
        ),
        role("admin", "Administrator", &["notification:read:all"], &["member"]),
    ]
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MarketConfig {
    #[serde(default = "default_roles")]
    pub roles: Vec<RoleSpec>,
    #[serde(default)]
    pub session: SessionRoles,
    #[serde(default)]
    pub trade: TradeSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            roles: default_roles(),
            session: SessionRoles::default(),
            trade: TradeSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MarketConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), roles = config.roles.len(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid configuration")
    }

    /// Compile the configured roles. Also checks that the session roles are
    /// declared, since every request would fail otherwise.
    pub fn compile_permissions(&self) -> Result<Arc<CompiledPermissionGraph>> {
        let graph = PermissionGraph::from_specs(self.roles.clone())
            .context("invalid role configuration")?;
        let compiled =
            CompiledPermissionGraph::compile(&graph).context("failed to compile permissions")?;

        let declared: BTreeSet<&str> = compiled.roles().collect();
        let session_roles = std::iter::once(self.session.guest_role.as_str())
            .chain(self.session.authenticated_role.as_deref());
        for role in session_roles {
            if !declared.contains(role) {
                bail!("session role `{role}` is not a declared role");
            }
        }

        Ok(Arc::new(compiled))
    }
}
