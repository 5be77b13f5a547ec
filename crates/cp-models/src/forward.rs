//! Forward records and the keys that identify live tunnels

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::ProxyEndpoint;
use crate::error::ModelError;
use crate::model_set::Model;
use crate::time::pseudo_zero;

/// Direction of a forward as declared by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ForwardType {
    /// Listen on the agent host, connect from the endpoint side
    #[default]
    Local,
    /// Listen on the endpoint side, connect from the agent host
    Remote,
    /// Anything else; kept verbatim so it can be reported and skipped
    Other(String),
}

impl From<String> for ForwardType {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "local" => ForwardType::Local,
            "remote" => ForwardType::Remote,
            _ => ForwardType::Other(s),
        }
    }
}

impl From<ForwardType> for String {
    fn from(t: ForwardType) -> Self {
        match t {
            ForwardType::Local => "local".to_string(),
            ForwardType::Remote => "remote".to_string(),
            ForwardType::Other(s) => s,
        }
    }
}

impl fmt::Display for ForwardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardType::Local => write!(f, "local"),
            ForwardType::Remote => write!(f, "remote"),
            ForwardType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A declared port-forward rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Forward identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Local or remote
    #[serde(rename = "type", default)]
    pub forward_type: ForwardType,

    /// Port on the listening side
    #[serde(default)]
    pub bind_port: u16,

    /// Destination address for tunneled connections
    #[serde(default)]
    pub remote_addr: String,

    /// Destination port for tunneled connections
    #[serde(default)]
    pub remote_port: u16,

    /// Owning endpoint
    #[serde(default)]
    pub proxy_endpoint_id: String,

    /// Agent expected to serve this forward
    #[serde(default)]
    pub proxy_agent_id: String,

    /// Seconds without a heartbeat before the control plane considers it dead
    #[serde(default)]
    pub last_seen_timeout: u32,

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

impl Default for Forward {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            forward_type: ForwardType::Local,
            bind_port: 0,
            remote_addr: String::new(),
            remote_port: 0,
            proxy_endpoint_id: String::new(),
            proxy_agent_id: String::new(),
            last_seen_timeout: 0,
            update_version: 0,
            deleted: false,
            pending_deleted: false,
            created_at: pseudo_zero(),
            updated_at: pseudo_zero(),
        }
    }
}

impl Forward {
    /// Derive the tunnel identity of this forward.
    ///
    /// Local forwards are keyed on the agent's bind address, remote forwards
    /// on the endpoint's intranet address; both use the forward's bind port.
    pub fn key(&self, endpoint: &ProxyEndpoint, bind_addr: &str) -> Result<ForwardKey, ModelError> {
        if self.bind_port == 0 {
            return Err(ModelError::InvalidBindPort {
                forward_id: self.id.clone(),
            });
        }
        match &self.forward_type {
            ForwardType::Local => Ok(ForwardKey::new(
                &endpoint.id,
                ForwardSide::Local,
                bind_addr,
                self.bind_port,
            )),
            ForwardType::Remote => {
                if endpoint.intranet_ip_addr.is_empty() {
                    return Err(ModelError::MissingIntranetAddr {
                        endpoint_id: endpoint.id.clone(),
                        forward_id: self.id.clone(),
                    });
                }
                Ok(ForwardKey::new(
                    &endpoint.id,
                    ForwardSide::Remote,
                    &endpoint.intranet_ip_addr,
                    self.bind_port,
                ))
            }
            ForwardType::Other(kind) => Err(ModelError::UnknownForwardType {
                forward_id: self.id.clone(),
                kind: kind.clone(),
            }),
        }
    }
}

impl Model for Forward {
    const KEYWORD: &'static str = "proxy_forward";
    const KEYWORD_PLURAL: &'static str = "proxy_forwards";

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

/// Which side of the tunnel holds the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForwardSide {
    Local,
    Remote,
}

impl fmt::Display for ForwardSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardSide::Local => write!(f, "L"),
            ForwardSide::Remote => write!(f, "R"),
        }
    }
}

/// Identity of a live tunnel: `(endpoint, side, listen address, listen port)`.
///
/// Two forwards with the same key are the same tunnel regardless of their
/// ids; changing any component means closing one tunnel and opening another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardKey {
    pub endpoint_id: String,
    pub side: ForwardSide,
    pub addr: String,
    pub port: u16,
}

impl ForwardKey {
    pub fn new(endpoint_id: &str, side: ForwardSide, addr: &str, port: u16) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            side,
            addr: addr.to_string(),
            port,
        }
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}:{}", self.endpoint_id, self.side, self.addr, self.port)
    }
}
