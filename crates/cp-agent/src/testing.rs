//! In-memory test doubles for the control plane and the SSH connector

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cp_core::traits::{AgentAddrUpdate, EventNotification, ListQuery, ListResult};
use cp_core::{ApiError, ControlPlane, SshError};
use cp_models::{EndpointConfig, Forward, Model, ProxyAgent, ProxyEndpoint};

use crate::ssh::{BoxedStream, Connection, InboundChannel, SshConnector, SshTransport};

#[derive(Default)]
struct ApiState {
    agent: Option<ProxyAgent>,
    agent_fetch_failures: usize,
    agent_updates: Vec<AgentAddrUpdate>,
    endpoints: Vec<ProxyEndpoint>,
    forwards: Vec<Forward>,
    fail_lists: bool,
    heartbeats: Vec<String>,
    notifications: Vec<EventNotification>,
}

/// Control plane backed by plain vectors
#[derive(Default)]
pub(crate) struct FakeControlPlane {
    state: Mutex<ApiState>,
    list_calls: AtomicUsize,
}

impl FakeControlPlane {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_agent(&self, agent: ProxyAgent) {
        self.state.lock().unwrap().agent = Some(agent);
    }

    pub(crate) fn fail_agent_fetches(&self, count: usize) {
        self.state.lock().unwrap().agent_fetch_failures = count;
    }

    pub(crate) fn agent_updates(&self) -> Vec<AgentAddrUpdate> {
        self.state.lock().unwrap().agent_updates.clone()
    }

    pub(crate) fn set_endpoints(&self, endpoints: Vec<ProxyEndpoint>) {
        self.state.lock().unwrap().endpoints = endpoints;
    }

    pub(crate) fn set_forwards(&self, forwards: Vec<Forward>) {
        self.state.lock().unwrap().forwards = forwards;
    }

    pub(crate) fn fail_lists(&self, fail: bool) {
        self.state.lock().unwrap().fail_lists = fail;
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn heartbeats(&self) -> Vec<String> {
        self.state.lock().unwrap().heartbeats.clone()
    }

    pub(crate) fn notifications(&self) -> Vec<EventNotification> {
        self.state.lock().unwrap().notifications.clone()
    }

    fn page<M: Model>(&self, rows: &[M], query: &ListQuery) -> Result<ListResult<M>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().unwrap().fail_lists {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let matching: Vec<M> = rows
            .iter()
            .filter(|row| match query.since {
                Some(since) => row.updated_at() >= since,
                None => !row.is_removed(),
            })
            .cloned()
            .collect();
        Ok(ListResult {
            total: matching.len(),
            offset: query.offset,
            limit: query.limit,
            skipped: 0,
            data: matching
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .collect(),
        })
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_agent(&self, id: &str) -> Result<ProxyAgent, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.agent_fetch_failures > 0 {
            state.agent_fetch_failures -= 1;
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        state.agent.clone().filter(|a| a.id == id).ok_or(ApiError::Status {
            status: 404,
            body: format!("proxy agent {} not found", id),
        })
    }

    async fn update_agent(
        &self,
        id: &str,
        update: &AgentAddrUpdate,
    ) -> Result<ProxyAgent, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.agent_updates.push(update.clone());
        let agent = ProxyAgent {
            id: id.to_string(),
            bind_addr: update.bind_addr.clone(),
            advertise_addr: update.advertise_addr.clone(),
            ..Default::default()
        };
        state.agent = Some(agent.clone());
        Ok(agent)
    }

    async fn list_endpoints(
        &self,
        query: &ListQuery,
    ) -> Result<ListResult<ProxyEndpoint>, ApiError> {
        let rows = self.state.lock().unwrap().endpoints.clone();
        self.page(&rows, query)
    }

    async fn list_forwards(&self, query: &ListQuery) -> Result<ListResult<Forward>, ApiError> {
        let rows = self.state.lock().unwrap().forwards.clone();
        self.page(&rows, query)
    }

    async fn heartbeat_forward(&self, id: &str) -> Result<(), ApiError> {
        self.state.lock().unwrap().heartbeats.push(id.to_string());
        Ok(())
    }

    async fn notify_event(&self, event: &EventNotification) -> Result<(), ApiError> {
        self.state.lock().unwrap().notifications.push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    dials: Vec<String>,
    fail_dials: usize,
    deny_remote_listen: bool,
    connections: Vec<Arc<FakeTransport>>,
}

/// SSH connector whose "endpoint side" is the local host
#[derive(Default)]
pub(crate) struct FakeConnector {
    state: Mutex<ConnectorState>,
    remote_listen_requests: Arc<AtomicUsize>,
    panic_remote_listen: Arc<AtomicBool>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_dials(&self, count: usize) {
        self.state.lock().unwrap().fail_dials = count;
    }

    pub(crate) fn deny_remote_listen(&self, deny: bool) {
        self.state.lock().unwrap().deny_remote_listen = deny;
    }

    /// Make every live and future connection panic inside
    /// `request_remote_listener`
    pub(crate) fn panic_on_remote_listen(&self, panic: bool) {
        self.panic_remote_listen.store(panic, Ordering::SeqCst);
    }

    pub(crate) fn dialed_hosts(&self) -> Vec<String> {
        self.state.lock().unwrap().dials.clone()
    }

    pub(crate) fn remote_listen_requests(&self) -> usize {
        self.remote_listen_requests.load(Ordering::SeqCst)
    }

    /// Drop every live connection as if the network went away
    pub(crate) fn drop_connections(&self) {
        for conn in self.state.lock().unwrap().connections.drain(..) {
            conn.gone.cancel();
        }
    }

    fn live(&self) -> Vec<Arc<FakeTransport>> {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| !c.gone.is_cancelled())
            .cloned()
            .collect()
    }

    /// Wait until a live connection holds a remote listener on `addr:port`
    pub(crate) async fn wait_remote_listener(&self, addr: &str, port: u16) {
        let wanted = (addr.to_string(), port);
        for _ in 0..500 {
            if self
                .live()
                .iter()
                .any(|c| c.listeners.lock().unwrap().contains(&wanted))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote listener {}:{} never requested", addr, port);
    }
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(&self, config: &EndpointConfig) -> Result<Connection, SshError> {
        let mut state = self.state.lock().unwrap();
        state.dials.push(config.host.clone());
        if state.fail_dials > 0 {
            state.fail_dials -= 1;
            return Err(SshError::Connect {
                addr: config.address(),
                message: "connection refused".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(16);
        let transport = Arc::new(FakeTransport {
            gone: CancellationToken::new(),
            listeners: Mutex::new(HashSet::new()),
            _inbound: tx,
            deny_remote_listen: state.deny_remote_listen,
            remote_listen_requests: Arc::clone(&self.remote_listen_requests),
            panic_remote_listen: Arc::clone(&self.panic_remote_listen),
        });
        state.connections.push(Arc::clone(&transport));
        Ok(Connection {
            transport,
            inbound: rx,
        })
    }
}

/// Connection whose direct channels are plain local TCP connections
pub(crate) struct FakeTransport {
    gone: CancellationToken,
    listeners: Mutex<HashSet<(String, u16)>>,
    /// Keeps the client's inbound channel stream open
    _inbound: mpsc::Sender<InboundChannel>,
    deny_remote_listen: bool,
    remote_listen_requests: Arc<AtomicUsize>,
    panic_remote_listen: Arc<AtomicBool>,
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<BoxedStream, SshError> {
        if self.gone.is_cancelled() {
            return Err(SshError::Closed);
        }
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn request_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError> {
        self.remote_listen_requests.fetch_add(1, Ordering::SeqCst);
        if self.panic_remote_listen.load(Ordering::SeqCst) {
            panic!("remote listener {}:{} exploded", addr, port);
        }
        if self.deny_remote_listen {
            return Err(SshError::RemoteListenDenied {
                addr: addr.to_string(),
                port,
                message: "administratively prohibited".to_string(),
            });
        }
        self.listeners
            .lock()
            .unwrap()
            .insert((addr.to_string(), port));
        Ok(())
    }

    async fn cancel_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError> {
        self.listeners
            .lock()
            .unwrap()
            .remove(&(addr.to_string(), port));
        Ok(())
    }

    async fn closed(&self) {
        self.gone.cancelled().await
    }

    async fn disconnect(&self) {
        self.gone.cancel();
    }
}
