//! cp-core: Core abstractions and configuration for the cloudproxy agent
//!
//! This crate provides the shared error types, the agent configuration and
//! the control-plane trait the agent's components are written against.

pub mod config;
pub mod error;
pub mod traits;

pub use error::{ApiError, ConfigError, ForwardError, RegisterError, SshError};
pub use traits::ControlPlane;
