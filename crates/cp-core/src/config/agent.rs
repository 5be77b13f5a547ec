//! Agent configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::ssh::SshConfig;
use crate::error::ConfigError;

/// Lower bound for the API poll interval, in seconds
pub const MIN_SYNC_INTERVAL_SECS: u64 = 10;

/// Lower bound for the API list page size
pub const MIN_LIST_BATCH_SIZE: usize = 20;

/// Configuration for the proxy agent daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity of this agent in the control plane
    pub proxy_agent_id: String,

    /// Upper bound on the startup self-registration retry loop
    #[serde(with = "duration_secs")]
    pub proxy_agent_init_wait: Duration,

    /// Poll interval; see [`AgentConfig::sync_interval`]
    pub api_sync_interval_seconds: u64,

    /// Page size; see [`AgentConfig::list_batch_size`]
    pub api_list_batch_size: usize,

    /// Every N-th sync lists everything instead of only recent changes.
    /// Zero means every sync is a full listing.
    pub api_full_sync_every: u32,

    /// Period of the reconciler's own refresh tick
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,

    /// Region used to pick service endpoints from the catalog
    pub region: String,

    /// Control-plane credentials
    pub auth: AuthConfig,

    /// SSH client settings
    pub ssh: SshConfig,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_agent_id: String::new(),
            proxy_agent_init_wait: Duration::from_secs(15),
            api_sync_interval_seconds: MIN_SYNC_INTERVAL_SECS,
            api_list_batch_size: 1024,
            api_full_sync_every: 30,
            refresh_interval: Duration::from_secs(11),
            region: String::new(),
            auth: AuthConfig::default(),
            ssh: SshConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// API poll interval, floored at ten seconds
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.api_sync_interval_seconds.max(MIN_SYNC_INTERVAL_SECS))
    }

    /// API page size, floored at twenty
    pub fn list_batch_size(&self) -> usize {
        self.api_list_batch_size.max(MIN_LIST_BATCH_SIZE)
    }

    /// Check the fields the agent cannot start without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_agent_id.trim().is_empty() {
            return Err(ConfigError::MissingField("proxy_agent_id".to_string()));
        }
        if self.auth.auth_url.trim().is_empty() {
            return Err(ConfigError::MissingField("auth.auth_url".to_string()));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "refresh_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Credentials and catalog selection for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity service URL, e.g. `https://keystone:5000/v3`
    pub auth_url: String,

    /// Admin user name
    pub username: String,

    /// Admin password
    pub password: String,

    /// User domain
    pub domain: String,

    /// Project to scope the token to
    pub project: String,

    /// Domain of the project
    pub project_domain: String,

    /// Catalog interface to use (`internal`, `public`, `admin`)
    pub interface: String,

    /// Service type → base URL, taking precedence over the catalog
    pub endpoint_overrides: HashMap<String, String>,

    /// Refresh a cached token this long before it expires
    #[serde(with = "duration_secs")]
    pub early_refresh: Duration,

    /// Per-request timeout for control-plane calls
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            username: String::new(),
            password: String::new(),
            domain: "Default".to_string(),
            project: "system".to_string(),
            project_domain: "Default".to_string(),
            interface: "internal".to_string(),
            endpoint_overrides: HashMap::new(),
            early_refresh: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
        }
    }
}
