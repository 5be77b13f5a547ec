//! Shared helpers for the integration tests
//!
//! A control plane backed by vectors and an SSH connector whose endpoint
//! side is the local host: direct channels are plain TCP connections and
//! remote listeners are recorded so tests can push channels through them.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cp_agent::ssh::{BoxedStream, Connection, InboundChannel, SshConnector, SshTransport};
use cp_agent::HostAddrs;
use cp_core::traits::{AgentAddrUpdate, EventNotification, ListQuery, ListResult};
use cp_core::{ApiError, ControlPlane, SshError};
use cp_models::{EndpointConfig, Forward, ForwardType, ProxyAgent, ProxyEndpoint};

pub const AGENT_ID: &str = "self";

#[derive(Default)]
struct PlaneState {
    agent: Option<ProxyAgent>,
    endpoints: Vec<ProxyEndpoint>,
    forwards: Vec<Forward>,
    notifications: Vec<EventNotification>,
}

/// Control plane serving whatever the test last stored
#[derive(Default)]
pub struct MemoryControlPlane {
    state: Mutex<PlaneState>,
}

impl MemoryControlPlane {
    pub fn new() -> Arc<Self> {
        let plane = Self::default();
        plane.state.lock().unwrap().agent = Some(ProxyAgent {
            id: AGENT_ID.to_string(),
            bind_addr: "127.0.0.1".to_string(),
            advertise_addr: "127.0.0.1".to_string(),
            ..Default::default()
        });
        Arc::new(plane)
    }

    pub fn set_endpoints(&self, endpoints: Vec<ProxyEndpoint>) {
        self.state.lock().unwrap().endpoints = endpoints;
    }

    pub fn set_forwards(&self, forwards: Vec<Forward>) {
        self.state.lock().unwrap().forwards = forwards;
    }

    pub fn notifications(&self) -> Vec<EventNotification> {
        self.state.lock().unwrap().notifications.clone()
    }
}

fn page<T: Clone>(rows: Vec<T>, query: &ListQuery) -> ListResult<T> {
    ListResult {
        total: rows.len(),
        offset: query.offset,
        limit: query.limit,
        skipped: 0,
        data: rows.into_iter().skip(query.offset).take(query.limit).collect(),
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn get_agent(&self, id: &str) -> Result<ProxyAgent, ApiError> {
        self.state
            .lock()
            .unwrap()
            .agent
            .clone()
            .filter(|a| a.id == id)
            .ok_or(ApiError::Status {
                status: 404,
                body: "not found".to_string(),
            })
    }

    async fn update_agent(&self, id: &str, update: &AgentAddrUpdate) -> Result<ProxyAgent, ApiError> {
        let agent = ProxyAgent {
            id: id.to_string(),
            bind_addr: update.bind_addr.clone(),
            advertise_addr: update.advertise_addr.clone(),
            ..Default::default()
        };
        self.state.lock().unwrap().agent = Some(agent.clone());
        Ok(agent)
    }

    async fn list_endpoints(&self, query: &ListQuery) -> Result<ListResult<ProxyEndpoint>, ApiError> {
        let rows = self.state.lock().unwrap().endpoints.clone();
        Ok(page(rows, query))
    }

    async fn list_forwards(&self, query: &ListQuery) -> Result<ListResult<Forward>, ApiError> {
        let rows = self.state.lock().unwrap().forwards.clone();
        Ok(page(rows, query))
    }

    async fn heartbeat_forward(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn notify_event(&self, event: &EventNotification) -> Result<(), ApiError> {
        self.state.lock().unwrap().notifications.push(event.clone());
        Ok(())
    }
}

/// Host whose only address is loopback
pub struct LoopbackHost;

impl HostAddrs for LoopbackHost {
    fn is_local(&self, addr: &str) -> bool {
        addr == "127.0.0.1"
    }

    fn primary_ipv4(&self) -> io::Result<Ipv4Addr> {
        Ok(Ipv4Addr::LOCALHOST)
    }
}

/// SSH connector that "connects" to every endpoint in-process
#[derive(Default)]
pub struct LoopbackConnector {
    dials: Mutex<Vec<String>>,
    live: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dialed_hosts(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }

    fn find_listener(&self, addr: &str, port: u16) -> Option<Arc<LoopbackTransport>> {
        let wanted = (addr.to_string(), port);
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !t.gone.is_cancelled())
            .find(|t| t.listeners.lock().unwrap().contains(&wanted))
            .cloned()
    }

    /// Wait until some live connection holds a remote listener on `addr:port`
    pub async fn wait_remote_listener(&self, addr: &str, port: u16) {
        for _ in 0..500 {
            if self.find_listener(addr, port).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote listener {}:{} never requested", addr, port);
    }

    /// Play a client of the remote listener on `addr:port`
    pub async fn inject_inbound(&self, addr: &str, port: u16) -> DuplexStream {
        let transport = self
            .find_listener(addr, port)
            .expect("no live connection with that remote listener");
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        transport
            .inbound
            .send(InboundChannel {
                address: addr.to_string(),
                port,
                originator: "10.9.9.9:50000".to_string(),
                stream: Box::new(theirs),
            })
            .await
            .expect("client stopped receiving channels");
        ours
    }
}

#[async_trait]
impl SshConnector for LoopbackConnector {
    async fn connect(&self, config: &EndpointConfig) -> Result<Connection, SshError> {
        self.dials.lock().unwrap().push(config.host.clone());
        let (tx, rx) = mpsc::channel(16);
        let transport = Arc::new(LoopbackTransport {
            gone: CancellationToken::new(),
            listeners: Mutex::new(HashSet::new()),
            inbound: tx,
        });
        self.live.lock().unwrap().push(Arc::clone(&transport));
        Ok(Connection {
            transport,
            inbound: rx,
        })
    }
}

pub struct LoopbackTransport {
    gone: CancellationToken,
    listeners: Mutex<HashSet<(String, u16)>>,
    inbound: mpsc::Sender<InboundChannel>,
}

#[async_trait]
impl SshTransport for LoopbackTransport {
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<BoxedStream, SshError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn request_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError> {
        self.listeners.lock().unwrap().insert((addr.to_string(), port));
        Ok(())
    }

    async fn cancel_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError> {
        self.listeners.lock().unwrap().remove(&(addr.to_string(), port));
        Ok(())
    }

    async fn closed(&self) {
        self.gone.cancelled().await
    }

    async fn disconnect(&self) {
        self.gone.cancel();
    }
}

pub fn endpoint(id: &str, host: &str, version: i64) -> ProxyEndpoint {
    ProxyEndpoint {
        id: id.to_string(),
        user: "u".to_string(),
        host: host.to_string(),
        port: 22,
        private_key: "K".to_string(),
        intranet_ip_addr: "192.168.10.2".to_string(),
        update_version: version,
        ..Default::default()
    }
}

pub fn forward(
    id: &str,
    endpoint_id: &str,
    forward_type: ForwardType,
    bind_port: u16,
    remote_port: u16,
) -> Forward {
    Forward {
        id: id.to_string(),
        forward_type,
        bind_port,
        remote_addr: "127.0.0.1".to_string(),
        remote_port,
        proxy_endpoint_id: endpoint_id.to_string(),
        proxy_agent_id: AGENT_ID.to_string(),
        last_seen_timeout: 60,
        update_version: 1,
        ..Default::default()
    }
}

/// A port nothing listens on right now
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Start an echo server and return its port
pub async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// Round-trip a message through a local listener, retrying until it is up
pub async fn wait_echo(port: u16) {
    for _ in 0..500 {
        if let Ok(mut conn) = TcpStream::connect(("127.0.0.1", port)).await {
            if conn.write_all(b"ping").await.is_ok() {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).await.is_ok() && &buf == b"ping" {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no echo through 127.0.0.1:{}", port);
}

/// Wait until nothing accepts on a local port
pub async fn wait_closed(port: u16) {
    for _ in 0..500 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("127.0.0.1:{} still accepting", port);
}

/// Poll `cond` until it holds
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
