//! HTTP implementation of the control-plane API
//!
//! Resources live under `/<keyword_plural>[/<id>[/<action>]]` on the service
//! URL taken from the session catalog. Single objects travel wrapped in their
//! singular keyword, listings in the plural keyword next to the paging
//! fields.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use cp_core::traits::{AgentAddrUpdate, EventNotification, ListQuery, ListResult};
use cp_core::{ApiError, ControlPlane};
use cp_models::{Forward, Model, ProxyAgent, ProxyEndpoint};

use super::session::SessionCache;

/// Catalog service type of the proxy resources
pub const CLOUDPROXY_SERVICE: &str = "cloudproxy";

/// Catalog service type of the notification resources
pub const NOTIFY_SERVICE: &str = "notify";

const AGENT_KEYWORD: &str = "proxy_agent";
const AGENT_KEYWORD_PLURAL: &str = "proxy_agents";
const NOTIFICATION_KEYWORD: &str = "notification";
const NOTIFICATION_KEYWORD_PLURAL: &str = "notifications";

/// Control-plane client over reqwest
pub struct HttpControlPlane {
    http: reqwest::Client,
    sessions: Arc<SessionCache>,
    region: String,
    interface: String,
}

impl HttpControlPlane {
    pub fn new(
        sessions: Arc<SessionCache>,
        request_timeout: Duration,
        region: impl Into<String>,
        interface: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            sessions,
            region: region.into(),
            interface: interface.into(),
        })
    }

    /// Issue one request and return the decoded JSON body (`Null` when empty)
    async fn request<B: Serialize + ?Sized>(
        &self,
        service: &str,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&B>,
    ) -> Result<Value, ApiError> {
        let session = self.sessions.get().await?;
        let base = session
            .service_url(service)
            .ok_or_else(|| ApiError::MissingService {
                service: service.to_string(),
                region: self.region.clone(),
                interface: self.interface.clone(),
            })?;
        let url = format!("{}/{}", base.trim_end_matches('/'), path);

        tracing::debug!(%method, %url, "Control-plane request");
        let mut req = self
            .http
            .request(method, &url)
            .header("X-Auth-Token", &session.token);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.sessions.invalidate(&session.token).await;
            return Err(ApiError::Unauthorized(text));
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn list<M: Model + DeserializeOwned>(
        &self,
        query: &ListQuery,
    ) -> Result<ListResult<M>, ApiError> {
        let body = self
            .request::<Value>(
                CLOUDPROXY_SERVICE,
                Method::GET,
                M::KEYWORD_PLURAL,
                &query.to_params(),
                None,
            )
            .await?;
        decode_list(body, M::KEYWORD_PLURAL)
    }
}

/// Wrap a request body in its keyword envelope
fn wrap_keyword<T: Serialize + ?Sized>(keyword: &str, value: &T) -> Result<Value, ApiError> {
    let value = serde_json::to_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;
    let mut map = serde_json::Map::new();
    map.insert(keyword.to_string(), value);
    Ok(Value::Object(map))
}

/// Take the object out of its keyword envelope, accepting a bare object too
fn unwrap_keyword<T: DeserializeOwned>(mut body: Value, keyword: &str) -> Result<T, ApiError> {
    let inner = if body.get(keyword).is_some() {
        body[keyword].take()
    } else {
        body
    };
    serde_json::from_value(inner).map_err(|e| ApiError::Decode(format!("{}: {}", keyword, e)))
}

/// Decode a listing page row by row.
///
/// A row that does not fit its model is logged and skipped so one bad
/// record cannot hold back the rest of the listing.
fn decode_list<T: DeserializeOwned>(
    mut body: Value,
    keyword_plural: &str,
) -> Result<ListResult<T>, ApiError> {
    let key = if body.get(keyword_plural).is_some() {
        keyword_plural
    } else {
        "data"
    };
    let rows = match body.get_mut(key).map(Value::take) {
        Some(Value::Array(rows)) => rows,
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(ApiError::Decode(format!(
                "{}: expected a list, got {}",
                keyword_plural, other
            )))
        }
    };

    let mut data = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value(row) {
            Ok(item) => data.push(item),
            Err(e) => {
                tracing::warn!(kind = keyword_plural, id = %id, error = %e, "Skipping undecodable record");
                skipped += 1;
            }
        }
    }

    let field = |name: &str| body.get(name).and_then(Value::as_u64).unwrap_or(0) as usize;
    Ok(ListResult {
        total: field("total"),
        offset: field("offset"),
        limit: field("limit"),
        skipped,
        data,
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_agent(&self, id: &str) -> Result<ProxyAgent, ApiError> {
        let body = self
            .request::<Value>(
                CLOUDPROXY_SERVICE,
                Method::GET,
                &format!("{}/{}", AGENT_KEYWORD_PLURAL, id),
                &[],
                None,
            )
            .await?;
        unwrap_keyword(body, AGENT_KEYWORD)
    }

    async fn update_agent(
        &self,
        id: &str,
        update: &AgentAddrUpdate,
    ) -> Result<ProxyAgent, ApiError> {
        let body = wrap_keyword(AGENT_KEYWORD, update)?;
        let resp = self
            .request(
                CLOUDPROXY_SERVICE,
                Method::PUT,
                &format!("{}/{}", AGENT_KEYWORD_PLURAL, id),
                &[],
                Some(&body),
            )
            .await?;
        unwrap_keyword(resp, AGENT_KEYWORD)
    }

    async fn list_endpoints(
        &self,
        query: &ListQuery,
    ) -> Result<ListResult<ProxyEndpoint>, ApiError> {
        self.list(query).await
    }

    async fn list_forwards(&self, query: &ListQuery) -> Result<ListResult<Forward>, ApiError> {
        self.list(query).await
    }

    async fn heartbeat_forward(&self, id: &str) -> Result<(), ApiError> {
        let body = wrap_keyword(Forward::KEYWORD, &json!({}))?;
        self.request(
            CLOUDPROXY_SERVICE,
            Method::POST,
            &format!("{}/{}/heartbeat", Forward::KEYWORD_PLURAL, id),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn notify_event(&self, event: &EventNotification) -> Result<(), ApiError> {
        let body = wrap_keyword(NOTIFICATION_KEYWORD, event)?;
        self.request(
            NOTIFY_SERVICE,
            Method::POST,
            &format!("{}/event-notify", NOTIFICATION_KEYWORD_PLURAL),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }
}
