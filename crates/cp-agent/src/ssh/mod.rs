//! SSH client set and forward supervision

mod client;
mod client_set;
mod connector;
mod forward;
mod transport;

pub use client::{ClientState, SshClient};
pub use client_set::ClientSet;
pub use connector::RusshConnector;
pub use forward::{
    ForwardRequest, LocalForwardRequest, RemoteForwardRequest, TickCallback,
};
pub use transport::{
    BoxedStream, Connection, DuplexStream, InboundChannel, SshConnector, SshTransport,
};
