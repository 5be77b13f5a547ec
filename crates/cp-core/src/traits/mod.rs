//! Core trait definitions

mod control_plane;

pub use control_plane::{
    AgentAddrUpdate, ControlPlane, EventAction, EventNotification, ListQuery, ListResult,
};
