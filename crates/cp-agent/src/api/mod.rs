//! Control-plane access: cached sessions and the HTTP client

mod client;
mod session;

pub use client::{HttpControlPlane, CLOUDPROXY_SERVICE, NOTIFY_SERVICE};
pub use session::{ApiSession, Authenticator, KeystoneAuthenticator, SessionCache};
