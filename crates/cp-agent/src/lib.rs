//! cp-agent: cloudproxy agent
//!
//! The agent keeps a set of SSH port forwards in line with what the
//! control plane declares for it. An API poller folds paged listings of
//! proxy endpoints and forwards into an in-memory snapshot; the worker
//! reconciles one SSH client per endpoint and one tunnel per forward
//! against that snapshot, heartbeating every live forward.

pub mod api;
pub mod backoff;
pub mod netutil;
pub mod ssh;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use api::{HttpControlPlane, KeystoneAuthenticator, SessionCache};
pub use netutil::{HostAddrs, SystemHostAddrs};
pub use ssh::{ClientSet, RusshConnector};
pub use sync::ModelSetPoller;
pub use worker::{ReconcileReport, Worker};
