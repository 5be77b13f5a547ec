//! cp-models: Control-plane data model for the cloudproxy agent
//!
//! This crate defines the entities the agent consumes from the control
//! plane (agents, proxy endpoints, forwards), the versioned per-kind model
//! sets used to diff successive listings, and the joined snapshot handed
//! to the reconciler.

pub mod agent;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod model_set;
pub mod snapshot;
pub mod time;

pub use agent::ProxyAgent;
pub use endpoint::{EndpointConfig, ProxyEndpoint};
pub use error::ModelError;
pub use forward::{Forward, ForwardKey, ForwardSide, ForwardType};
pub use model_set::{ApplyOutcome, Model, ModelSet};
pub use snapshot::{JoinedEndpoint, ModelSets, Snapshot};
pub use time::pseudo_zero;
