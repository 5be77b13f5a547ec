//! One SSH client per proxy endpoint
//!
//! Each client is an actor: a supervisor task owns the connection, redials
//! it with exponential backoff when it drops, and re-opens every forward
//! whose request it still holds once the connection is back up. Closing the
//! client cancels its token, which stops the supervisor and every forward
//! task under it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cp_core::config::SshConfig;
use cp_core::ForwardError;
use cp_models::{EndpointConfig, ForwardKey};

use super::forward::{start_local, start_remote, ForwardRequest, RunningForward};
use super::transport::{InboundChannel, SshConnector, SshTransport};
use crate::backoff::ExponentialBackoff;

/// Lifecycle of an SSH client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, supervisor not yet running
    New,
    /// First handshake in progress; forward requests are queued
    Dialing,
    /// Connected; forward requests are served immediately
    Up,
    /// Connection lost or dial failed; redialing with backoff
    Reconnecting,
    /// Terminal
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::New => "new",
            ClientState::Dialing => "dialing",
            ClientState::Up => "up",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct ForwardEntry {
    request: ForwardRequest,
    /// `None` while the client is not connected
    running: Option<RunningForward>,
}

struct ClientInner {
    /// Set while the connection is up
    transport: Option<Arc<dyn SshTransport>>,
    forwards: HashMap<ForwardKey, ForwardEntry>,
    closed: bool,
}

struct ClientShared {
    endpoint_id: String,
    config: EndpointConfig,
    grace: Duration,
    cancel: CancellationToken,
    state: watch::Sender<ClientState>,
    inner: Mutex<ClientInner>,
    /// Remote listener port → forward receiving its channels
    routes: RwLock<HashMap<u16, mpsc::Sender<InboundChannel>>>,
}

impl ClientShared {
    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(endpoint_id = %self.endpoint_id, from = %previous, to = %state, "SSH client state");
        }
    }

    async fn start(
        &self,
        transport: &Arc<dyn SshTransport>,
        request: &ForwardRequest,
    ) -> Result<RunningForward, ForwardError> {
        match request {
            ForwardRequest::Local(req) => {
                start_local(Arc::clone(transport), req, &self.cancel, self.grace).await
            }
            ForwardRequest::Remote(req) => {
                let (running, route) =
                    start_remote(Arc::clone(transport), req, &self.cancel, self.grace).await?;
                self.routes.write().await.insert(req.remote_port, route);
                Ok(running)
            }
        }
    }

    async fn add_forward(&self, request: ForwardRequest) -> Result<(), ForwardError> {
        let key = request.key(&self.endpoint_id);
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ForwardError::ClientClosed(self.endpoint_id.clone()));
        }
        if inner.forwards.contains_key(&key) {
            return Err(ForwardError::DuplicateKey(key));
        }

        let running = match inner.transport.clone() {
            Some(transport) => Some(self.start(&transport, &request).await?),
            None => {
                tracing::debug!(%key, "SSH client not connected, forward queued");
                None
            }
        };
        inner.forwards.insert(key, ForwardEntry { request, running });
        Ok(())
    }

    async fn close_forward(&self, key: &ForwardKey) -> bool {
        let entry = self.inner.lock().await.forwards.remove(key);
        let Some(entry) = entry else {
            return false;
        };
        if let ForwardRequest::Remote(req) = &entry.request {
            self.routes.write().await.remove(&req.remote_port);
        }
        if let Some(running) = entry.running {
            running.stop(self.grace).await;
        }
        tracing::info!(%key, "Forward closed");
        true
    }

    /// Mark the connection up and open every queued forward.
    ///
    /// Forwards that fail to open are dropped so the next reconcile pass
    /// requests them again.
    async fn bring_up(&self, transport: Arc<dyn SshTransport>) {
        let mut inner = self.inner.lock().await;
        inner.transport = Some(Arc::clone(&transport));

        let mut failed = Vec::new();
        for (key, entry) in inner.forwards.iter_mut() {
            if entry.running.is_some() {
                continue;
            }
            match self.start(&transport, &entry.request).await {
                Ok(running) => entry.running = Some(running),
                Err(e) => {
                    tracing::error!(%key, error = %e, "Failed to open forward");
                    failed.push(key.clone());
                }
            }
        }
        for key in failed {
            inner.forwards.remove(&key);
        }
        self.set_state(ClientState::Up);
    }

    /// Stop every running forward but keep the requests for the next `bring_up`
    async fn bring_down(&self) {
        let running: Vec<RunningForward> = {
            let mut inner = self.inner.lock().await;
            inner.transport = None;
            inner
                .forwards
                .values_mut()
                .filter_map(|entry| entry.running.take())
                .collect()
        };
        self.routes.write().await.clear();
        join_all(running.into_iter().map(|r| r.stop(self.grace))).await;
    }

    async fn shutdown(&self) {
        self.inner.lock().await.closed = true;
        self.bring_down().await;
        self.inner.lock().await.forwards.clear();
        self.set_state(ClientState::Closed);
    }

    async fn dispatch(&self, channel: InboundChannel) {
        let route = self.routes.read().await.get(&channel.port).cloned();
        match route {
            Some(route) => {
                if route.send(channel).await.is_err() {
                    tracing::debug!(endpoint_id = %self.endpoint_id, "Forward closed before taking its channel");
                }
            }
            None => {
                tracing::warn!(
                    endpoint_id = %self.endpoint_id,
                    address = %channel.address,
                    port = channel.port,
                    "Inbound channel for an unknown remote listener"
                );
            }
        }
    }

    /// Route inbound channels until the connection drops or the client is
    /// cancelled. Returns `true` when cancelled.
    async fn serve(
        &self,
        transport: &Arc<dyn SshTransport>,
        mut inbound: mpsc::Receiver<InboundChannel>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = transport.closed() => return false,
                channel = inbound.recv() => match channel {
                    Some(channel) => self.dispatch(channel).await,
                    None => return false,
                },
            }
        }
    }
}

async fn supervise(
    shared: Arc<ClientShared>,
    connector: Arc<dyn SshConnector>,
    mut backoff: ExponentialBackoff,
) {
    let endpoint_id = shared.endpoint_id.clone();
    let addr = shared.config.to_string();
    shared.set_state(ClientState::Dialing);

    loop {
        let connected = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            connected = connector.connect(&shared.config) => connected,
        };

        match connected {
            Ok(conn) => {
                backoff.reset();
                tracing::info!(%endpoint_id, %addr, "SSH client connected");
                let transport = conn.transport;
                shared.bring_up(Arc::clone(&transport)).await;
                let cancelled = shared.serve(&transport, conn.inbound).await;
                shared.bring_down().await;
                if cancelled {
                    if tokio::time::timeout(shared.grace, transport.disconnect())
                        .await
                        .is_err()
                    {
                        tracing::debug!(%endpoint_id, "Timed out disconnecting");
                    }
                    break;
                }
                tracing::warn!(%endpoint_id, %addr, "SSH connection lost");
            }
            Err(e) => {
                tracing::warn!(%endpoint_id, %addr, error = %e, "SSH connect failed");
            }
        }

        shared.set_state(ClientState::Reconnecting);
        let delay = backoff.next_delay();
        tracing::debug!(%endpoint_id, ?delay, "Reconnecting after delay");
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.shutdown().await;
    tracing::info!(%endpoint_id, "SSH client closed");
}

/// SSH client for one endpoint
pub struct SshClient {
    shared: Arc<ClientShared>,
    supervisor: Option<JoinHandle<()>>,
    state_rx: watch::Receiver<ClientState>,
    /// Reconcile generation that last claimed this client
    pub(crate) mark: u64,
}

impl SshClient {
    /// Create the client and start dialing
    pub fn spawn(
        endpoint_id: &str,
        config: EndpointConfig,
        connector: Arc<dyn SshConnector>,
        ssh: &SshConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ClientState::New);
        let shared = Arc::new(ClientShared {
            endpoint_id: endpoint_id.to_string(),
            config,
            grace: ssh.shutdown_grace,
            cancel: parent.child_token(),
            state: state_tx,
            inner: Mutex::new(ClientInner {
                transport: None,
                forwards: HashMap::new(),
                closed: false,
            }),
            routes: RwLock::new(HashMap::new()),
        });
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&shared),
            connector,
            ExponentialBackoff::from_config(&ssh.backoff),
        ));
        Self {
            shared,
            supervisor: Some(supervisor),
            state_rx,
            mark: 0,
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.shared.endpoint_id
    }

    /// Connection parameters this client was created with
    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Open (or queue, while not connected) a forward on this client
    pub async fn add_forward(&self, request: ForwardRequest) -> Result<(), ForwardError> {
        self.shared.add_forward(request).await
    }

    /// Close a forward and drain it; returns whether it existed
    pub async fn close_forward(&self, key: &ForwardKey) -> bool {
        self.shared.close_forward(key).await
    }

    /// Keys of every forward held, running or queued
    pub async fn forward_keys(&self) -> Vec<ForwardKey> {
        self.shared.inner.lock().await.forwards.keys().cloned().collect()
    }

    /// Close the connection and every forward under it
    pub async fn close(mut self) {
        self.shared.cancel.cancel();
        let Some(mut supervisor) = self.supervisor.take() else {
            return;
        };
        let deadline = self.shared.grace.saturating_mul(3);
        if tokio::time::timeout(deadline, &mut supervisor).await.is_err() {
            tracing::warn!(endpoint_id = %self.shared.endpoint_id, "SSH client did not stop in time, aborting");
            supervisor.abort();
            self.shared.shutdown().await;
        }
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl fmt::Debug for SshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClient")
            .field("endpoint_id", &self.shared.endpoint_id)
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .field("mark", &self.mark)
            .finish()
    }
}
