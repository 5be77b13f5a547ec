//! Control-plane API traits
//!
//! The agent only consumes a handful of control-plane operations; they are
//! collected here so the poller, the reconciler and the heartbeat tasks can
//! be driven by the HTTP client in production and by an in-memory double in
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use cp_models::{Forward, ProxyAgent, ProxyEndpoint};

/// One page request of a model listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Page size
    pub limit: usize,
    /// Rows to skip
    pub offset: usize,
    /// Only rows updated at or after this time, deleted rows included.
    /// `None` lists every live row.
    pub since: Option<DateTime<Utc>>,
}

impl ListQuery {
    /// First page of a full listing
    pub fn full(limit: usize) -> Self {
        Self {
            limit,
            offset: 0,
            since: None,
        }
    }

    /// First page of a listing of rows changed since `since`
    pub fn incremental(limit: usize, since: DateTime<Utc>) -> Self {
        Self {
            limit,
            offset: 0,
            since: Some(since),
        }
    }

    /// Same query, starting at `offset`
    pub fn at_offset(&self, offset: usize) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// Query string parameters understood by the control plane
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("scope".to_string(), "system".to_string()),
            ("details".to_string(), "false".to_string()),
            ("limit".to_string(), self.limit.to_string()),
            ("offset".to_string(), self.offset.to_string()),
            ("order".to_string(), "asc".to_string()),
            ("order_by.0".to_string(), "updated_at".to_string()),
            ("order_by.1".to_string(), "created_at".to_string()),
            ("order_by.2".to_string(), "id".to_string()),
        ];
        if let Some(since) = self.since {
            params.push((
                "filter.0".to_string(),
                format!(
                    "updated_at.ge('{}')",
                    since.to_rfc3339_opts(SecondsFormat::Nanos, true)
                ),
            ));
            params.push(("pending_delete".to_string(), "all".to_string()));
            params.push(("delete".to_string(), "all".to_string()));
        }
        params
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult<T> {
    pub data: Vec<T>,
    pub total: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
    /// Rows the server sent that could not be decoded
    #[serde(default)]
    pub skipped: usize,
}

impl<T> ListResult<T> {
    /// Rows this page consumed from the listing, decoded or not
    pub fn rows(&self) -> usize {
        self.data.len() + self.skipped
    }

    /// Whether no further pages should be requested
    pub fn is_last_page(&self) -> bool {
        self.rows() == 0 || self.offset + self.rows() >= self.total
    }
}

/// Addresses written back to the agent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAddrUpdate {
    pub bind_addr: String,
    pub advertise_addr: String,
}

/// Kind of out-of-band event raised by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventAction {
    /// A sync produced forwards that reference missing endpoints
    NetOutOfSync,
    /// A reconcile pass panicked
    BugReport,
}

/// Payload of the `event-notify` notification action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNotification {
    pub action: EventAction,
    pub resource_type: String,
    pub resource_id: String,
    pub message: String,
}

impl EventNotification {
    /// Notification for an incorrect join
    pub fn out_of_sync(agent_id: &str, orphans: &[String]) -> Self {
        Self {
            action: EventAction::NetOutOfSync,
            resource_type: "proxy_agent".to_string(),
            resource_id: agent_id.to_string(),
            message: format!(
                "proxy forwards reference missing endpoints: {}",
                orphans.join(", ")
            ),
        }
    }

    /// Notification for a recovered reconcile panic
    pub fn bug_report(agent_id: &str, message: impl Into<String>) -> Self {
        Self {
            action: EventAction::BugReport,
            resource_type: "proxy_agent".to_string(),
            resource_id: agent_id.to_string(),
            message: message.into(),
        }
    }
}

/// The control-plane operations the agent depends on
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `proxy-agents.get(id)`
    async fn get_agent(&self, id: &str) -> Result<ProxyAgent, ApiError>;

    /// `proxy-agents.put(id, {bind_addr, advertise_addr})`
    async fn update_agent(&self, id: &str, update: &AgentAddrUpdate)
        -> Result<ProxyAgent, ApiError>;

    /// One page of `proxy-endpoints.list`
    async fn list_endpoints(&self, query: &ListQuery)
        -> Result<ListResult<ProxyEndpoint>, ApiError>;

    /// One page of `proxy-forwards.list`
    async fn list_forwards(&self, query: &ListQuery) -> Result<ListResult<Forward>, ApiError>;

    /// `proxy-forwards.perform("heartbeat", id)`
    async fn heartbeat_forward(&self, id: &str) -> Result<(), ApiError>;

    /// `notifications.perform("event-notify", event)`
    async fn notify_event(&self, event: &EventNotification) -> Result<(), ApiError>;
}
