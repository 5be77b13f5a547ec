//! SSH client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Settings shared by every SSH client the agent opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Handshake plus authentication deadline
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// SSH keepalive interval
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Drop the connection after this long without traffic or keepalive replies
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,

    /// How long a closing client or forward may take to drain
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Reconnect backoff
    pub backoff: BackoffConfig,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
