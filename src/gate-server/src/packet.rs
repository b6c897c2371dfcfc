//! Minimal IP header inspection for the forwarder.
//!
//! Only what flow tracking needs: version, protocol, addresses and the
//! UDP ports. Extension headers in IPv6 are not walked.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown IP version: {0}")]
    UnknownVersion(u8),

    #[error("packet too short: {0} bytes")]
    Truncated(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Parsed IP header fields
#[derive(Debug, Clone)]
pub struct IpPacketInfo {
    pub version: IpVersion,
    pub header_len: usize,
    pub protocol: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
}

impl IpPacketInfo {
    pub fn parse(packet: &[u8]) -> Result<Self, PacketError> {
        let first = *packet.first().ok_or(PacketError::Empty)?;
        match first >> 4 {
            4 => Self::parse_ipv4(packet),
            6 => Self::parse_ipv6(packet),
            v => Err(PacketError::UnknownVersion(v)),
        }
    }

    fn parse_ipv4(packet: &[u8]) -> Result<Self, PacketError> {
        if packet.len() < IPV4_MIN_HEADER {
            return Err(PacketError::Truncated(packet.len()));
        }
        let header_len = usize::from(packet[0] & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER || packet.len() < header_len {
            return Err(PacketError::Truncated(packet.len()));
        }
        Ok(Self {
            version: IpVersion::V4,
            header_len,
            protocol: packet[9],
            src_addr: IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])),
            dst_addr: IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])),
        })
    }

    fn parse_ipv6(packet: &[u8]) -> Result<Self, PacketError> {
        if packet.len() < IPV6_HEADER {
            return Err(PacketError::Truncated(packet.len()));
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&packet[8..24]);
        dst.copy_from_slice(&packet[24..40]);
        Ok(Self {
            version: IpVersion::V6,
            header_len: IPV6_HEADER,
            protocol: packet[6],
            src_addr: IpAddr::V6(Ipv6Addr::from(src)),
            dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
        })
    }

    pub fn is_icmp(&self) -> bool {
        matches!(
            (self.version, self.protocol),
            (IpVersion::V4, PROTO_ICMP) | (IpVersion::V6, PROTO_ICMPV6)
        )
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    /// Source and destination ports of a UDP packet.
    pub fn udp_ports(&self, packet: &[u8]) -> Option<(u16, u16)> {
        if !self.is_udp() || packet.len() < self.header_len + UDP_HEADER {
            return None;
        }
        let udp = &packet[self.header_len..];
        Some((
            u16::from_be_bytes([udp[0], udp[1]]),
            u16::from_be_bytes([udp[2], udp[3]]),
        ))
    }

    /// Flow key of a UDP packet, `None` for anything else.
    pub fn udp_flow(&self, packet: &[u8]) -> Option<FlowKey> {
        let (src_port, dst_port) = self.udp_ports(packet)?;
        Some(FlowKey {
            protocol: self.protocol,
            source: SocketAddr::new(self.src_addr, src_port),
            destination: SocketAddr::new(self.dst_addr, dst_port),
        })
    }
}

/// Protocol plus both endpoints of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl FlowKey {
    /// Same flow seen from the other direction.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            source: self.destination,
            destination: self.source,
        }
    }
}
