//! Cached control-plane credentials
//!
//! A [`SessionCache`] hands out the current admin session and transparently
//! re-acquires one when the cached token is within the early-refresh window
//! of its expiry. Reads share a lock; refreshes are serialized so a burst of
//! callers produces a single login.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use cp_core::config::AuthConfig;
use cp_core::ApiError;

/// Header carrying the issued token on a Keystone login response
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// An authenticated control-plane session
#[derive(Debug, Clone)]
pub struct ApiSession {
    /// Token sent as `X-Auth-Token`
    pub token: String,
    /// When the token stops being accepted
    pub expires_at: DateTime<Utc>,
    /// Service type → base URL
    services: HashMap<String, String>,
}

impl ApiSession {
    pub fn new(
        token: impl Into<String>,
        expires_at: DateTime<Utc>,
        services: HashMap<String, String>,
    ) -> Self {
        Self {
            token: token.into(),
            expires_at,
            services,
        }
    }

    /// Base URL of a service, if the session knows one
    pub fn service_url(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(String::as_str)
    }

    /// Whether the session is still usable at `now` given the refresh margin
    pub fn is_fresh(&self, now: DateTime<Utc>, early_refresh: Duration) -> bool {
        let margin = chrono::Duration::from_std(early_refresh).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(deadline) => deadline < self.expires_at,
            None => false,
        }
    }
}

/// Acquires a fresh session
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<ApiSession, ApiError>;
}

/// Shared, lazily refreshed control-plane session
pub struct SessionCache {
    authenticator: Arc<dyn Authenticator>,
    early_refresh: Duration,
    current: RwLock<Option<Arc<ApiSession>>>,
    refresh: Mutex<()>,
}

impl SessionCache {
    pub fn new(authenticator: Arc<dyn Authenticator>, early_refresh: Duration) -> Self {
        Self {
            authenticator,
            early_refresh,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Return the cached session, acquiring a new one when needed.
    ///
    /// Acquisition errors are returned as-is; the cache does not retry.
    pub async fn get(&self) -> Result<Arc<ApiSession>, ApiError> {
        if let Some(session) = self.cached().await {
            return Ok(session);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(session) = self.cached().await {
            return Ok(session);
        }

        tracing::debug!("Acquiring control-plane session");
        let session = Arc::new(self.authenticator.authenticate().await?);
        tracing::info!(expires_at = %session.expires_at, "Control-plane session acquired");
        *self.current.write().await = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop the cached session if it still carries `token`.
    ///
    /// Called when the server rejects a token so the next `get` logs in again.
    pub async fn invalidate(&self, token: &str) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|s| s.token == token) {
            tracing::warn!("Control-plane session rejected, dropping it");
            *current = None;
        }
    }

    async fn cached(&self) -> Option<Arc<ApiSession>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|s| s.is_fresh(Utc::now(), self.early_refresh))
            .cloned()
    }
}

/// Password login against a Keystone v3 identity service
pub struct KeystoneAuthenticator {
    http: reqwest::Client,
    auth: AuthConfig,
    region: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogService>,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    #[serde(default)]
    interface: String,
    #[serde(default)]
    region_id: String,
    #[serde(default)]
    region: String,
    url: String,
}

impl KeystoneAuthenticator {
    pub fn new(http: reqwest::Client, auth: AuthConfig, region: impl Into<String>) -> Self {
        Self {
            http,
            auth,
            region: region.into(),
        }
    }

    fn login_body(&self) -> serde_json::Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.auth.username,
                            "password": self.auth.password,
                            "domain": { "name": self.auth.domain },
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.auth.project,
                        "domain": { "name": self.auth.project_domain },
                    }
                }
            }
        })
    }

    /// Reduce the catalog to one URL per service type for our region and
    /// interface, then layer the configured overrides on top.
    fn services(&self, catalog: Vec<CatalogService>) -> HashMap<String, String> {
        let mut services = HashMap::new();
        for service in catalog {
            let url = service.endpoints.into_iter().find(|ep| {
                let region_ok = self.region.is_empty()
                    || ep.region_id == self.region
                    || ep.region == self.region;
                region_ok && ep.interface.eq_ignore_ascii_case(&self.auth.interface)
            });
            if let Some(ep) = url {
                services.insert(service.service_type, ep.url);
            }
        }
        for (service, url) in &self.auth.endpoint_overrides {
            services.insert(service.clone(), url.clone());
        }
        services
    }
}

#[async_trait]
impl Authenticator for KeystoneAuthenticator {
    async fn authenticate(&self) -> Result<ApiSession, ApiError> {
        let url = format!("{}/auth/tokens", self.auth.auth_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&self.login_body())
            .timeout(self.auth.request_timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Auth(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let token = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError::Auth(format!("missing {} header", SUBJECT_TOKEN_HEADER)))?;

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(ApiSession::new(
            token,
            body.token.expires_at,
            self.services(body.token.catalog),
        ))
    }
}
