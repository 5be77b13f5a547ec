//! Proxy agent record

use serde::{Deserialize, Serialize};

/// This agent's record in the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAgent {
    /// Agent identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Local address forwards listen on
    #[serde(default)]
    pub bind_addr: String,

    /// Address other parties should use to reach this agent
    #[serde(default)]
    pub advertise_addr: String,
}
