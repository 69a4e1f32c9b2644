//! Typed configuration intake for a fleet.
//!
//! Raw config (usually YAML) is deserialised into these types with unknown
//! fields rejected, then [`FleetConfig::validate`] checks everything serde
//! cannot express, reporting field-path errors. Downstream components only
//! ever see the validated, resolved form.

use crate::fleet::server_id::ServerId;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(30_000);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(5_000);
const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 5;
const DEFAULT_RESTART_BACKOFF_BASE: Duration = Duration::from_millis(1_000);
const DEFAULT_RESTART_BACKOFF_MAX: Duration = Duration::from_millis(30_000);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{path}: {reason}")]
    InvalidField { path: String, reason: String },

    #[error("duplicate server name `{0}`")]
    DuplicateName(String),

    #[error("could not parse configuration: {0}")]
    Parse(String),
}

/// Configuration of a whole fleet: optional policy defaults plus the server
/// list.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    #[serde(default)]
    pub defaults: LifecycleOverrides,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Configuration of one server.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: ServerId,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub lifecycle: LifecycleOverrides,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_true() -> bool {
    true
}

/// How the server is reached: a locally spawned child process over stdio, or
/// a remote HTTP endpoint.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum ConnectionConfig {
    Stdio(StdioConnection),
    Http(HttpConnection),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StdioConnection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpConnection {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A partial lifecycle policy. Unset fields fall through to the fleet
/// defaults and finally to the built-in defaults.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LifecycleOverrides {
    pub health_check_enabled: Option<bool>,
    pub health_check_interval_ms: Option<u64>,
    pub health_check_timeout_ms: Option<u64>,
    pub unhealthy_threshold: Option<u32>,
    pub auto_restart_enabled: Option<bool>,
    pub max_restart_attempts: Option<u32>,
    pub restart_backoff_base_ms: Option<u64>,
    pub restart_backoff_max_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

impl LifecycleOverrides {
    /// Folds `self` over `base`: fields set here win.
    fn over(&self, base: &LifecycleOverrides) -> LifecycleOverrides {
        LifecycleOverrides {
            health_check_enabled: self.health_check_enabled.or(base.health_check_enabled),
            health_check_interval_ms: self
                .health_check_interval_ms
                .or(base.health_check_interval_ms),
            health_check_timeout_ms: self
                .health_check_timeout_ms
                .or(base.health_check_timeout_ms),
            unhealthy_threshold: self.unhealthy_threshold.or(base.unhealthy_threshold),
            auto_restart_enabled: self.auto_restart_enabled.or(base.auto_restart_enabled),
            max_restart_attempts: self.max_restart_attempts.or(base.max_restart_attempts),
            restart_backoff_base_ms: self
                .restart_backoff_base_ms
                .or(base.restart_backoff_base_ms),
            restart_backoff_max_ms: self.restart_backoff_max_ms.or(base.restart_backoff_max_ms),
            shutdown_timeout_ms: self.shutdown_timeout_ms.or(base.shutdown_timeout_ms),
        }
    }
}

/// The fully resolved lifecycle policy of one server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecyclePolicy {
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub auto_restart_enabled: bool,
    pub max_restart_attempts: u32,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            health_check_enabled: true,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            auto_restart_enabled: true,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            restart_backoff_base: DEFAULT_RESTART_BACKOFF_BASE,
            restart_backoff_max: DEFAULT_RESTART_BACKOFF_MAX,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl LifecyclePolicy {
    /// Resolves a server's policy: per-server overrides over fleet defaults
    /// over built-ins.
    pub fn resolve(defaults: &LifecycleOverrides, overrides: &LifecycleOverrides) -> Self {
        let merged = overrides.over(defaults);
        let builtin = LifecyclePolicy::default();
        Self {
            health_check_enabled: merged
                .health_check_enabled
                .unwrap_or(builtin.health_check_enabled),
            health_check_interval: merged
                .health_check_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(builtin.health_check_interval),
            health_check_timeout: merged
                .health_check_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(builtin.health_check_timeout),
            unhealthy_threshold: merged
                .unhealthy_threshold
                .unwrap_or(builtin.unhealthy_threshold),
            auto_restart_enabled: merged
                .auto_restart_enabled
                .unwrap_or(builtin.auto_restart_enabled),
            max_restart_attempts: merged
                .max_restart_attempts
                .unwrap_or(builtin.max_restart_attempts),
            restart_backoff_base: merged
                .restart_backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(builtin.restart_backoff_base),
            restart_backoff_max: merged
                .restart_backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(builtin.restart_backoff_max),
            shutdown_timeout: merged
                .shutdown_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(builtin.shutdown_timeout),
        }
    }
}

impl FleetConfig {
    /// Parses and validates a YAML fleet configuration in one step.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig =
            serde_yaml::from_str(yaml).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything the type system does not: duplicate names, empty
    /// commands, malformed URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            if !seen.insert(&server.name) {
                return Err(ConfigError::DuplicateName(server.name.to_string()));
            }
            validate_connection(&server.connection, &format!("servers[{index}].connection"))?;
        }
        Ok(())
    }
}

pub(crate) fn validate_connection(
    connection: &ConnectionConfig,
    path: &str,
) -> Result<(), ConfigError> {
    match connection {
        ConnectionConfig::Stdio(stdio) => {
            if stdio.command.trim().is_empty() {
                return Err(ConfigError::InvalidField {
                    path: format!("{path}.stdio.command"),
                    reason: "must be a non-empty string".to_string(),
                });
            }
        }
        ConnectionConfig::Http(http) => {
            let url = Url::parse(&http.url).map_err(|err| ConfigError::InvalidField {
                path: format!("{path}.http.url"),
                reason: err.to_string(),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidField {
                    path: format!("{path}.http.url"),
                    reason: format!("unsupported scheme `{}`", url.scheme()),
                });
            }
        }
    }
    Ok(())
}
