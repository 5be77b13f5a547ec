//! Control-plane client integration tests
//!
//! Runs the Keystone login, the session cache and the HTTP client against a
//! mock control plane served by axum on a loopback port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use cp_agent::{HttpControlPlane, KeystoneAuthenticator, ModelSetPoller, SessionCache};
use cp_core::config::{AgentConfig, AuthConfig};
use cp_core::traits::{AgentAddrUpdate, EventNotification, ListQuery};
use cp_core::{ApiError, ControlPlane};

const REGION: &str = "Yunion";

struct Mock {
    base: String,
    logins: AtomicUsize,
    reject_next: AtomicBool,
    bad_forward: AtomicBool,
    endpoint_count: usize,
    queries: Mutex<Vec<HashMap<String, String>>>,
    agent_puts: Mutex<Vec<Value>>,
    heartbeats: Mutex<Vec<(String, Value)>>,
    notifications: Mutex<Vec<Value>>,
}

type Shared = Arc<Mock>;

impl Mock {
    /// Check the token, honoring a pending forced rejection
    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let token = headers
            .get("X-Auth-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if token.is_empty() || self.reject_next.swap(false, Ordering::SeqCst) {
            return Err((StatusCode::UNAUTHORIZED, "token rejected").into_response());
        }
        Ok(())
    }
}

async fn login(State(mock): State<Shared>, Json(body): Json<Value>) -> Response {
    assert_eq!(body["auth"]["identity"]["password"]["user"]["name"], "admin");
    let n = mock.logins.fetch_add(1, Ordering::SeqCst);
    let catalog = json!([
        {
            "type": "cloudproxy",
            "endpoints": [
                { "interface": "internal", "region_id": REGION, "url": format!("{}/cloudproxy", mock.base) },
                { "interface": "public", "region_id": REGION, "url": "http://unreachable.invalid" }
            ]
        },
        {
            "type": "notify",
            "endpoints": [
                { "interface": "internal", "region_id": REGION, "url": format!("{}/notify", mock.base) }
            ]
        }
    ]);
    let expires_at = chrono::Utc::now() + chrono::Duration::hours(24);
    (
        StatusCode::CREATED,
        [("X-Subject-Token", format!("token-{}", n))],
        Json(json!({ "token": { "expires_at": expires_at, "catalog": catalog } })),
    )
        .into_response()
}

async fn get_agent(State(mock): State<Shared>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = mock.authorize(&headers) {
        return resp;
    }
    Json(json!({ "proxy_agent": { "id": id, "bind_addr": "10.0.0.1", "advertise_addr": "" } }))
        .into_response()
}

async fn put_agent(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = mock.authorize(&headers) {
        return resp;
    }
    mock.agent_puts.lock().unwrap().push(body.clone());
    let mut agent = body["proxy_agent"].clone();
    agent["id"] = json!(id);
    Json(json!({ "proxy_agent": agent })).into_response()
}

fn page_bounds(query: &HashMap<String, String>) -> (usize, usize) {
    let num = |k: &str| query.get(k).and_then(|v| v.parse().ok()).unwrap_or(0);
    (num("limit"), num("offset"))
}

async fn list_endpoints(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = mock.authorize(&headers) {
        return resp;
    }
    mock.queries.lock().unwrap().push(query.clone());
    let (limit, offset) = page_bounds(&query);
    let rows: Vec<Value> = (0..mock.endpoint_count)
        .skip(offset)
        .take(limit)
        .map(|i| {
            json!({
                "id": format!("e{:03}", i),
                "user": "root",
                "host": format!("10.0.1.{}", i),
                "port": 22,
                "private_key": "K",
                "update_version": 1
            })
        })
        .collect();
    Json(json!({
        "proxy_endpoints": rows,
        "total": mock.endpoint_count,
        "limit": limit,
        "offset": offset
    }))
    .into_response()
}

async fn list_forwards(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = mock.authorize(&headers) {
        return resp;
    }
    let (limit, offset) = page_bounds(&query);
    let mut rows = vec![json!({
        "id": "f1",
        "type": "local",
        "bind_port": 9000,
        "remote_addr": "10.1.0.5",
        "remote_port": 80,
        "proxy_endpoint_id": "e000",
        "proxy_agent_id": "self",
        "last_seen_timeout": 60,
        "update_version": 1
    })];
    if mock.bad_forward.load(Ordering::SeqCst) {
        rows.push(json!({
            "id": "f2",
            "type": "local",
            "bind_port": 70000,
            "remote_addr": "10.1.0.5",
            "remote_port": 80,
            "proxy_endpoint_id": "e000",
            "proxy_agent_id": "self",
            "update_version": 1
        }));
    }
    let total = rows.len();
    // Generic envelope; the client accepts it alongside the keyword one
    Json(json!({
        "data": rows,
        "total": total,
        "limit": limit,
        "offset": offset
    }))
    .into_response()
}

async fn heartbeat(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = mock.authorize(&headers) {
        return resp;
    }
    mock.heartbeats.lock().unwrap().push((id, body));
    StatusCode::OK.into_response()
}

async fn event_notify(State(mock): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(resp) = mock.authorize(&headers) {
        return resp;
    }
    mock.notifications.lock().unwrap().push(body);
    Json(json!({})).into_response()
}

async fn start_mock(endpoint_count: usize) -> Shared {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let mock = Arc::new(Mock {
        base,
        logins: AtomicUsize::new(0),
        reject_next: AtomicBool::new(false),
        bad_forward: AtomicBool::new(false),
        endpoint_count,
        queries: Mutex::new(Vec::new()),
        agent_puts: Mutex::new(Vec::new()),
        heartbeats: Mutex::new(Vec::new()),
        notifications: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/identity/v3/auth/tokens", post(login))
        .route("/cloudproxy/proxy_agents/:id", get(get_agent).put(put_agent))
        .route("/cloudproxy/proxy_endpoints", get(list_endpoints))
        .route("/cloudproxy/proxy_forwards", get(list_forwards))
        .route("/cloudproxy/proxy_forwards/:id/heartbeat", post(heartbeat))
        .route("/notify/notifications/event-notify", post(event_notify))
        .with_state(Arc::clone(&mock));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    mock
}

fn agent_config(mock: &Mock) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.proxy_agent_id = "self".to_string();
    config.region = REGION.to_string();
    config.api_list_batch_size = 20;
    config.auth = AuthConfig {
        auth_url: format!("{}/identity/v3", mock.base),
        username: "admin".to_string(),
        password: "secret".to_string(),
        ..AuthConfig::default()
    };
    config
}

fn client(config: &AgentConfig) -> Arc<HttpControlPlane> {
    let auth = Arc::new(KeystoneAuthenticator::new(
        reqwest::Client::new(),
        config.auth.clone(),
        config.region.clone(),
    ));
    let sessions = Arc::new(SessionCache::new(auth, config.auth.early_refresh));
    Arc::new(
        HttpControlPlane::new(
            sessions,
            config.auth.request_timeout,
            config.region.clone(),
            config.auth.interface.clone(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_poller_pages_through_listings() {
    let mock = start_mock(45).await;
    let config = agent_config(&mock);
    let api = client(&config);
    let mut poller = ModelSetPoller::new(api, &config);

    let snapshot = poller.run_manually().await.unwrap().unwrap();
    assert_eq!(snapshot.endpoint_count(), 45);
    assert_eq!(snapshot.forward_count(), 1);
    assert!(snapshot.is_correct());
    assert_eq!(snapshot.endpoint("e000").unwrap().forwards.len(), 1);

    let queries = mock.queries.lock().unwrap().clone();
    let offsets: Vec<&str> = queries.iter().map(|q| q["offset"].as_str()).collect();
    assert_eq!(offsets, vec!["0", "20", "40"]);
    assert!(queries.iter().all(|q| q["limit"] == "20" && q["scope"] == "system"));
    // First sync is a full listing
    assert!(queries.iter().all(|q| !q.contains_key("filter.0")));
    assert_eq!(mock.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_row_does_not_block_sync() {
    let mock = start_mock(1).await;
    mock.bad_forward.store(true, Ordering::SeqCst);
    let config = agent_config(&mock);
    let api = client(&config);
    let mut poller = ModelSetPoller::new(api, &config);

    let snapshot = poller.run_manually().await.unwrap().unwrap();
    assert_eq!(snapshot.endpoint_count(), 1);
    assert_eq!(snapshot.forward_count(), 1);
    assert!(snapshot.endpoint("e000").unwrap().forwards.contains_key("f1"));
    assert!(snapshot.is_correct());
}

#[tokio::test]
async fn test_incremental_listing_sends_watermark() {
    let mock = start_mock(3).await;
    let mut config = agent_config(&mock);
    config.api_full_sync_every = 10;
    let api = client(&config);
    let mut poller = ModelSetPoller::new(api, &config);

    poller.run_manually().await.unwrap();
    assert!(poller.run_manually().await.unwrap().is_none());

    let queries = mock.queries.lock().unwrap().clone();
    let last = queries.last().unwrap();
    assert!(last["filter.0"].starts_with("updated_at.ge('"));
    assert_eq!(last["delete"], "all");
}

#[tokio::test]
async fn test_agent_roundtrip_uses_keyword_envelope() {
    let mock = start_mock(0).await;
    let api = client(&agent_config(&mock));

    let agent = api.get_agent("self").await.unwrap();
    assert_eq!(agent.bind_addr, "10.0.0.1");
    assert!(agent.advertise_addr.is_empty());

    let update = AgentAddrUpdate {
        bind_addr: "10.0.0.9".to_string(),
        advertise_addr: "10.0.0.9".to_string(),
    };
    let updated = api.update_agent("self", &update).await.unwrap();
    assert_eq!(updated.id, "self");
    assert_eq!(updated.bind_addr, "10.0.0.9");
    assert_eq!(
        mock.agent_puts.lock().unwrap()[0],
        json!({ "proxy_agent": { "bind_addr": "10.0.0.9", "advertise_addr": "10.0.0.9" } })
    );
}

#[tokio::test]
async fn test_heartbeat_and_event_notify() {
    let mock = start_mock(0).await;
    let api = client(&agent_config(&mock));

    api.heartbeat_forward("f1").await.unwrap();
    let heartbeats = mock.heartbeats.lock().unwrap().clone();
    assert_eq!(heartbeats, vec![("f1".to_string(), json!({ "proxy_forward": {} }))]);

    let event = EventNotification::out_of_sync("self", &["f9".to_string()]);
    api.notify_event(&event).await.unwrap();
    let sent = mock.notifications.lock().unwrap()[0].clone();
    assert_eq!(sent["notification"]["action"], "net-out-of-sync");
    assert_eq!(sent["notification"]["resource_id"], "self");
}

#[tokio::test]
async fn test_rejected_token_forces_new_login() {
    let mock = start_mock(2).await;
    let api = client(&agent_config(&mock));

    api.get_agent("self").await.unwrap();
    assert_eq!(mock.logins.load(Ordering::SeqCst), 1);

    mock.reject_next.store(true, Ordering::SeqCst);
    let err = api.list_endpoints(&ListQuery::full(20)).await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized(_)));

    let page = api.list_endpoints(&ListQuery::full(20)).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(mock.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_service_is_reported() {
    let mock = start_mock(0).await;
    let mut config = agent_config(&mock);
    config.auth.interface = "admin".to_string();
    let api = client(&config);

    let err = api.get_agent("self").await.unwrap_err();
    assert!(matches!(err, ApiError::MissingService { ref service, .. } if service == "cloudproxy"));
}

#[tokio::test]
async fn test_endpoint_override_wins_over_catalog() {
    let mock = start_mock(0).await;
    let mut config = agent_config(&mock);
    config.auth.interface = "public".to_string();
    config
        .auth
        .endpoint_overrides
        .insert("cloudproxy".to_string(), format!("{}/cloudproxy", mock.base));
    let api = client(&config);

    // The public catalog URL is unreachable; the override is used instead
    let agent = api.get_agent("self").await.unwrap();
    assert_eq!(agent.id, "self");
}
