//! Packet forwarding between a session's tunnel and the network.
//!
//! # Privacy
//! Nothing here logs IP addresses or ports. Only counts, lengths and
//! protocol classes are logged.

use crate::packet::{FlowKey, IpPacketInfo};
use crate::tunnel::{Tunnel, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default idle time after which a UDP flow stops counting as a connection.
pub const DEFAULT_UDP_FLOW_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_UDP_FLOWS: usize = 1024;

/// Moves packets between a tunnel and the network on behalf of a session.
#[async_trait]
pub trait PacketForwarder: Send + Sync {
    /// Forward packets received from the client to the network.
    fn send_packets(&self, packets: &[Bytes]);

    /// Hand a packet from the network back to the client.
    async fn deliver(&self, packet: Bytes) -> Result<(), TunnelError>;

    /// Live UDP flows opened by the client.
    fn udp_connection_count(&self) -> usize;

    fn is_ping_supported(&self) -> bool;

    fn dispose(&self);
}

/// Forwarder used by sessions: outbound packets go to a shared network
/// writer queue, inbound packets go out through the session tunnel.
pub struct SessionForwarder {
    tunnel: Arc<Tunnel>,
    network_tx: mpsc::Sender<Bytes>,
    ping_supported: bool,
    udp_flow_timeout: Duration,
    max_udp_flows: usize,
    udp_flows: Mutex<HashMap<FlowKey, Instant>>,
    dropped: AtomicU64,
    disposed: AtomicBool,
}

impl SessionForwarder {
    pub fn new(tunnel: Arc<Tunnel>, network_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tunnel,
            network_tx,
            ping_supported: true,
            udp_flow_timeout: DEFAULT_UDP_FLOW_TIMEOUT,
            max_udp_flows: DEFAULT_MAX_UDP_FLOWS,
            udp_flows: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_ping_supported(mut self, supported: bool) -> Self {
        self.ping_supported = supported;
        self
    }

    pub fn with_udp_flow_timeout(mut self, timeout: Duration) -> Self {
        self.udp_flow_timeout = timeout;
        self
    }

    /// Cap on tracked UDP flows. At least one flow is always kept.
    pub fn with_max_udp_flows(mut self, max: usize) -> Self {
        self.max_udp_flows = max.max(1);
        self
    }

    /// Packets dropped because they were invalid, unsupported or the
    /// network queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn drop_packet(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn purge_expired_flows(flows: &mut HashMap<FlowKey, Instant>, timeout: Duration) {
        flows.retain(|_, last| last.elapsed() < timeout);
    }

    /// Record activity on a client flow. A new flow arriving at the cap
    /// purges expired flows first, then evicts the least recently used.
    fn track_udp_flow(&self, flow: FlowKey) {
        let mut flows = self.udp_flows.lock();
        if !flows.contains_key(&flow) && flows.len() >= self.max_udp_flows {
            Self::purge_expired_flows(&mut flows, self.udp_flow_timeout);
            if flows.len() >= self.max_udp_flows {
                let oldest = flows
                    .iter()
                    .min_by_key(|(_, last)| **last)
                    .map(|(key, _)| *key);
                if let Some(oldest) = oldest {
                    flows.remove(&oldest);
                    trace!("UDP flow limit reached, oldest flow forgotten");
                }
            }
        }
        flows.insert(flow, Instant::now());
    }
}

#[async_trait]
impl PacketForwarder for SessionForwarder {
    fn send_packets(&self, packets: &[Bytes]) {
        if self.is_disposed() {
            return;
        }

        for packet in packets {
            let info = match IpPacketInfo::parse(packet) {
                Ok(info) => info,
                Err(e) => {
                    debug!(%e, packet_len = packet.len(), "Invalid IP packet from client, dropping");
                    self.drop_packet();
                    continue;
                }
            };

            if info.is_icmp() && !self.ping_supported {
                trace!("Ping not supported, ICMP packet dropped");
                self.drop_packet();
                continue;
            }

            if let Some(flow) = info.udp_flow(packet) {
                self.track_udp_flow(flow);
            }

            match self.network_tx.try_send(packet.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("Network queue full, packet dropped");
                    self.drop_packet();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Network writer closed");
                    self.drop_packet();
                    return;
                }
            }
        }
    }

    async fn deliver(&self, packet: Bytes) -> Result<(), TunnelError> {
        if self.is_disposed() {
            return Err(TunnelError::Disposed);
        }
        if let Ok(info) = IpPacketInfo::parse(&packet) {
            if let Some(flow) = info.udp_flow(&packet) {
                let mut flows = self.udp_flows.lock();
                if let Some(last) = flows.get_mut(&flow.reversed()) {
                    *last = Instant::now();
                }
            }
        }
        self.tunnel.send_packet(packet).await
    }

    fn udp_connection_count(&self) -> usize {
        let mut flows = self.udp_flows.lock();
        Self::purge_expired_flows(&mut flows, self.udp_flow_timeout);
        flows.len()
    }

    fn is_ping_supported(&self) -> bool {
        self.ping_supported
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let flows = std::mem::take(&mut *self.udp_flows.lock());
        debug!(udp_flows = flows.len(), dropped = self.dropped_count(), "Forwarder disposed");
    }
}
