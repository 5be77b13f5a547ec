//! SSH capability seam
//!
//! The client set only needs a handful of operations from an SSH library:
//! connect and authenticate, open a direct-tcpip channel, ask the server for
//! a remote listener and receive its forwarded channels, and notice when the
//! connection drops. They are expressed as traits so the production russh
//! transport can be swapped for an in-process fake in tests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use cp_core::SshError;
use cp_models::EndpointConfig;

/// Bidirectional byte stream that can be spliced with a TCP socket
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// Owned, type-erased duplex stream
pub type BoxedStream = Box<dyn DuplexStream>;

/// Connection delivered by the server for one of our remote listeners
pub struct InboundChannel {
    /// Address the remote listener was bound to
    pub address: String,
    /// Port the remote listener was bound to
    pub port: u16,
    /// Peer that connected to the remote listener
    pub originator: String,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundChannel")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("originator", &self.originator)
            .finish_non_exhaustive()
    }
}

/// An established, authenticated connection
pub struct Connection {
    pub transport: Arc<dyn SshTransport>,
    /// Forwarded channels for every remote listener on this connection
    pub inbound: mpsc::Receiver<InboundChannel>,
}

/// Dials endpoints
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Handshake and authenticate, bounded by the connector's own timeout
    async fn connect(&self, config: &EndpointConfig) -> Result<Connection, SshError>;
}

/// Operations on one live connection
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Open a channel to `host:port` as seen from the endpoint
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, SshError>;

    /// Ask the endpoint to listen on `addr:port`
    async fn request_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError>;

    /// Stop a remote listener
    async fn cancel_remote_listener(&self, addr: &str, port: u16) -> Result<(), SshError>;

    /// Resolves once the connection is gone
    async fn closed(&self);

    /// Close the connection
    async fn disconnect(&self);
}
