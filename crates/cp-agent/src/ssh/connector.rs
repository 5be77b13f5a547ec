//! russh-backed SSH transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::{CancellationToken, DropGuard};

use cp_core::config::SshConfig;
use cp_core::SshError;
use cp_models::EndpointConfig;

use super::transport::{BoxedStream, Connection, InboundChannel, SshConnector, SshTransport};

/// Buffered forwarded channels per connection.
///
/// The client supervisor hands every channel to its forward straight away,
/// so this only absorbs short bursts of inbound connections.
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// How often `closed()` double-checks the handle state
const CLOSED_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Dials proxy endpoints with russh
pub struct RusshConnector {
    config: Arc<Config>,
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(ssh: &SshConfig) -> Self {
        let config = Config {
            inactivity_timeout: Some(ssh.inactivity_timeout),
            keepalive_interval: Some(ssh.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout: ssh.connect_timeout,
        }
    }

    async fn handshake(
        &self,
        endpoint: &EndpointConfig,
        addr: &str,
    ) -> Result<Connection, SshError> {
        let key = russh_keys::decode_secret_key(&endpoint.private_key, None)
            .map_err(|e| SshError::InvalidKey(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let gone = CancellationToken::new();
        let handler = ClientHandler {
            inbound_tx,
            _gone: gone.clone().drop_guard(),
        };

        tracing::debug!(%addr, "Connecting");
        let mut handle = client::connect(
            Arc::clone(&self.config),
            (endpoint.host.as_str(), endpoint.port),
            handler,
        )
        .await
        .map_err(|e| SshError::Connect {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;

        tracing::debug!(user = %endpoint.user, %addr, "Authenticating");
        let authenticated = handle
            .authenticate_publickey(endpoint.user.clone(), Arc::new(key))
            .await
            .map_err(|e| SshError::Connect {
                addr: addr.to_string(),
                message: format!("authentication error: {}", e),
            })?;
        if !authenticated {
            return Err(SshError::AuthRejected {
                user: endpoint.user.clone(),
                addr: addr.to_string(),
            });
        }

        let transport = RusshTransport {
            handle: RwLock::new(handle),
            gone,
        };
        Ok(Connection {
            transport: Arc::new(transport),
            inbound: inbound_rx,
        })
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Connection, SshError> {
        let addr = endpoint.address();
        tokio::time::timeout(self.connect_timeout, self.handshake(endpoint, &addr))
            .await
            .map_err(|_| SshError::ConnectTimeout { addr: addr.clone() })?
    }
}

/// One live russh connection
struct RusshTransport {
    /// Written only to request or cancel remote listeners
    handle: RwLock<Handle<ClientHandler>>,
    /// Cancelled when the session task drops its handler
    gone: CancellationToken,
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, SshError> {
        let channel = self
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| SshError::Channel(format!("direct-tcpip to {}:{}: {}", host, port, e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError> {
        self.handle
            .write()
            .await
            .tcpip_forward(addr, u32::from(port))
            .await
            .map(|_| ())
            .map_err(|e| SshError::RemoteListenDenied {
                addr: addr.to_string(),
                port,
                message: e.to_string(),
            })
    }

    async fn cancel_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError> {
        self.handle
            .write()
            .await
            .cancel_tcpip_forward(addr, u32::from(port))
            .await
            .map(|_| ())
            .map_err(|e| SshError::Channel(format!("cancel-tcpip-forward {}:{}: {}", addr, port, e)))
    }

    async fn closed(&self) {
        let mut poll = tokio::time::interval(CLOSED_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.gone.cancelled() => return,
                _ = poll.tick() => {
                    if self.handle.read().await.is_closed() {
                        return;
                    }
                }
            }
        }
    }

    async fn disconnect(&self) {
        let handle = self.handle.read().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(error = %e, "Disconnect failed");
        }
    }
}

/// Per-connection russh handler
struct ClientHandler {
    inbound_tx: mpsc::Sender<InboundChannel>,
    /// Signals `RusshTransport::closed` when the session ends
    _gone: DropGuard,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Endpoint credentials come from the control plane, so any host key is accepted
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Ok(port) = u16::try_from(connected_port) else {
            tracing::warn!(connected_port, "Forwarded channel for an invalid port");
            return Ok(());
        };
        let inbound = InboundChannel {
            address: connected_address.to_string(),
            port,
            originator: format!("{}:{}", originator_address, originator_port),
            stream: Box::new(channel.into_stream()),
        };
        if self.inbound_tx.send(inbound).await.is_err() {
            tracing::debug!("Forwarded channel arrived after the client stopped listening");
        }
        Ok(())
    }
}
