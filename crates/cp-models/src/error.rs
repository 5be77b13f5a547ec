//! Model error types

use thiserror::Error;

/// Errors raised while validating control-plane records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Forward type is neither local nor remote
    #[error("Unknown forward type {kind:?} on forward {forward_id}")]
    UnknownForwardType { forward_id: String, kind: String },

    /// Forward has no usable bind port
    #[error("Forward {forward_id} has invalid bind port 0")]
    InvalidBindPort { forward_id: String },

    /// Remote forward on an endpoint without an intranet address
    #[error("Endpoint {endpoint_id} has no intranet address for remote forward {forward_id}")]
    MissingIntranetAddr {
        endpoint_id: String,
        forward_id: String,
    },

    /// Endpoint cannot be dialed
    #[error("Endpoint {endpoint_id} is not dialable: {reason}")]
    InvalidEndpoint { endpoint_id: String, reason: String },
}
