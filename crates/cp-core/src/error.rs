//! Core error types for the cloudproxy agent

use std::path::PathBuf;

use cp_models::ForwardKey;
use thiserror::Error;

/// Errors talking to the control plane
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request never produced a response
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credential was refused
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The service catalog has no usable URL for a service
    #[error("No {interface} endpoint for service {service:?} in region {region:?}")]
    MissingService {
        service: String,
        region: String,
        interface: String,
    },

    /// Credential acquisition failed
    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    /// Whether the server reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

/// SSH connection errors
#[derive(Error, Debug)]
pub enum SshError {
    /// Handshake did not finish in time
    #[error("Connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// Transport or handshake failure
    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    /// Endpoint refused the key
    #[error("Authentication rejected for {user}@{addr}")]
    AuthRejected { user: String, addr: String },

    /// Private key could not be decoded
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Channel open or I/O failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Endpoint refused to open a remote listener
    #[error("Remote listener {addr}:{port} denied: {message}")]
    RemoteListenDenied {
        addr: String,
        port: u16,
        message: String,
    },

    /// The connection is gone
    #[error("Connection closed")]
    Closed,
}

/// Errors opening or closing forwards on the client set
#[derive(Error, Debug)]
pub enum ForwardError {
    /// No SSH client exists for the endpoint
    #[error("No SSH client for endpoint {0}")]
    UnknownClient(String),

    /// A forward with the same key is already active
    #[error("Forward {0} is already active")]
    DuplicateKey(ForwardKey),

    /// Local listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// SSH-side failure
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// The owning client has been closed
    #[error("SSH client for endpoint {0} is closed")]
    ClientClosed(String),
}

/// Startup self-registration errors
#[derive(Error, Debug)]
pub enum RegisterError {
    /// Agent record could not be fetched within the init wait
    #[error("Failed to fetch proxy agent {id} after {attempts} attempts: {source}")]
    FetchAgent {
        id: String,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    /// No usable local address
    #[error("Failed to discover bind address: {0}")]
    BindDiscovery(String),

    /// Agent record update was refused
    #[error("Failed to update proxy agent {id}: {source}")]
    Update {
        id: String,
        #[source]
        source: ApiError,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
