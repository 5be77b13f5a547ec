//! Host address discovery

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Well-known routable address used to pick the outbound interface.
/// Connecting a UDP socket sends nothing.
const ROUTE_PROBE: &str = "8.8.8.8:80";

/// Facts about the host's addresses
pub trait HostAddrs: Send + Sync {
    /// Whether `addr` can be bound on this host
    fn is_local(&self, addr: &str) -> bool;

    /// IPv4 address of the interface carrying the default route
    fn primary_ipv4(&self) -> io::Result<Ipv4Addr>;
}

/// Queries the running host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHostAddrs;

impl HostAddrs for SystemHostAddrs {
    fn is_local(&self, addr: &str) -> bool {
        let Ok(ip) = addr.parse::<IpAddr>() else {
            return false;
        };
        UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
    }

    fn primary_ipv4(&self) -> io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_PROBE)?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable IPv4 address (got {})", other),
            )),
        }
    }
}
