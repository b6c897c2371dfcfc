//! UDP socket creation, injectable for tests and for platforms that need
//! socket options (protect/bind-to-device) applied before use.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Address family of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Wildcard address of this family with an ephemeral port.
    pub fn unspecified(self) -> SocketAddr {
        match self {
            AddressFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddressFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

impl From<&SocketAddr> for AddressFamily {
    fn from(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

/// Creates UDP sockets for channels and forwarders.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create_udp_socket(&self, family: AddressFamily) -> io::Result<UdpSocket>;
}

/// Binds to the family's wildcard address on an ephemeral port.
#[derive(Debug, Default, Clone)]
pub struct DefaultSocketFactory;

#[async_trait]
impl SocketFactory for DefaultSocketFactory {
    async fn create_udp_socket(&self, family: AddressFamily) -> io::Result<UdpSocket> {
        UdpSocket::bind(family.unspecified()).await
    }
}

/// Binds every socket to a fixed local IP (port still ephemeral).
#[derive(Debug, Clone)]
pub struct BoundSocketFactory {
    local_ip: IpAddr,
}

impl BoundSocketFactory {
    pub fn new(local_ip: IpAddr) -> Self {
        Self { local_ip }
    }
}

#[async_trait]
impl SocketFactory for BoundSocketFactory {
    async fn create_udp_socket(&self, family: AddressFamily) -> io::Result<UdpSocket> {
        let matches_family = match family {
            AddressFamily::V4 => self.local_ip.is_ipv4(),
            AddressFamily::V6 => self.local_ip.is_ipv6(),
        };
        let addr = if matches_family {
            SocketAddr::new(self.local_ip, 0)
        } else {
            family.unspecified()
        };
        UdpSocket::bind(addr).await
    }
}
