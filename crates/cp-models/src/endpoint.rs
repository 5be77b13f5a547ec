//! Proxy endpoint records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ModelError;
use crate::model_set::Model;
use crate::time::pseudo_zero;

/// A remote SSH server the agent may tunnel through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Endpoint identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// SSH login user
    #[serde(default)]
    pub user: String,

    /// SSH host
    #[serde(default)]
    pub host: String,

    /// SSH port
    #[serde(default)]
    pub port: u16,

    /// PEM-encoded private key used to authenticate
    #[serde(default)]
    pub private_key: String,

    /// Address reachable from the endpoint's side, used for remote listeners
    #[serde(default)]
    pub intranet_ip_addr: String,

    /// Monotonic revision
    #[serde(default)]
    pub update_version: i64,

    /// Hard deleted upstream
    #[serde(default)]
    pub deleted: bool,

    /// Soft deleted upstream
    #[serde(default)]
    pub pending_deleted: bool,

    #[serde(default = "pseudo_zero")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "pseudo_zero")]
    pub updated_at: DateTime<Utc>,
}

impl Default for ProxyEndpoint {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            user: String::new(),
            host: String::new(),
            port: 22,
            private_key: String::new(),
            intranet_ip_addr: String::new(),
            update_version: 0,
            deleted: false,
            pending_deleted: false,
            created_at: pseudo_zero(),
            updated_at: pseudo_zero(),
        }
    }
}

impl ProxyEndpoint {
    /// The connection parameters an SSH client for this endpoint is keyed on.
    ///
    /// Fails when the record cannot possibly be dialed, so that a bad row is
    /// rejected before it reaches the client set.
    pub fn ssh_config(&self) -> Result<EndpointConfig, ModelError> {
        let invalid = |reason: &str| ModelError::InvalidEndpoint {
            endpoint_id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.host.trim().is_empty() {
            return Err(invalid("empty host"));
        }
        if self.port == 0 {
            return Err(invalid("port 0"));
        }
        if self.user.is_empty() {
            return Err(invalid("empty user"));
        }
        if self.private_key.trim().is_empty() {
            return Err(invalid("empty private key"));
        }
        Ok(EndpointConfig {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            private_key: self.private_key.clone(),
        })
    }
}

impl Model for ProxyEndpoint {
    const KEYWORD: &'static str = "proxy_endpoint";
    const KEYWORD_PLURAL: &'static str = "proxy_endpoints";

    fn id(&self) -> &str {
        &self.id
    }

    fn update_version(&self) -> i64 {
        self.update_version
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn is_removed(&self) -> bool {
        self.deleted || self.pending_deleted
    }
}

/// SSH connection parameters of an endpoint.
///
/// Two configs compare equal only when every field matches; any change
/// forces the owning client to be reset.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub private_key: String,
}

impl EndpointConfig {
    /// `host:port` suitable for dialing
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Short SHA-256 fingerprint of the private key, safe to log
    pub fn key_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.private_key.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("key", &self.key_fingerprint())
            .finish()
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address())
    }
}
