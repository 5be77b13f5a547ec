//! Model-set sync with the control plane

mod poller;

pub use poller::ModelSetPoller;
