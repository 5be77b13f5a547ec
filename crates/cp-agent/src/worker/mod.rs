//! Agent worker: registration, heartbeats and the reconcile loop

mod heartbeat;
mod reconciler;
mod register;

pub use heartbeat::{heartbeat_callback, tick_duration};
pub use reconciler::{ReconcileReport, Worker};
pub use register::{register, Registration};
