//! Dedicated UDP datagram channel.
//!
//! One per session at most. The channel owns its socket and a 128-bit key
//! that the client receives in a [`UdpChannelResponse`]; packet sealing
//! with that key belongs to the wire layer.

use crate::tunnel::{ChannelId, ChannelKind, DatagramChannel, Tunnel, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use gate_common::{ResponseBase, SessionId, UdpChannelResponse, CHANNEL_KEY_LEN};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Largest datagram accepted from a client.
pub const MAX_DATAGRAM: usize = 65_507;

/// Datagram channel backed by its own UDP socket.
pub struct UdpChannel {
    id: ChannelId,
    session_id: SessionId,
    key: [u8; CHANNEL_KEY_LEN],
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl UdpChannel {
    pub fn new(
        socket: UdpSocket,
        session_id: SessionId,
        key: [u8; CHANNEL_KEY_LEN],
    ) -> Result<Self, TunnelError> {
        let local_addr = socket.local_addr()?;
        let id = ChannelId::next();
        debug!(session_id, channel = %id, port = local_addr.port(), "UDP channel created");
        Ok(Self {
            id,
            session_id,
            key,
            socket,
            local_addr,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn key(&self) -> &[u8; CHANNEL_KEY_LEN] {
        &self.key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Client endpoint learned from its first datagram.
    pub fn set_remote(&self, remote: SocketAddr) {
        *self.remote.lock() = Some(remote);
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    /// Port and key the client needs to reach this channel.
    pub fn response(&self) -> UdpChannelResponse {
        UdpChannelResponse::new(ResponseBase::ok(), self.local_port(), self.key.to_vec())
    }

    /// Receive one datagram from the client, remembering its endpoint.
    pub async fn recv_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed(self.id));
        }
        let (len, from) = self.socket.recv_from(buf).await?;
        self.set_remote(from);
        Ok(len)
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Udp
    }

    async fn send_packet(&self, packet: Bytes) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed(self.id));
        }
        let remote = self.remote().ok_or(TunnelError::NoRemote(self.id))?;
        self.socket.send_to(&packet, remote).await?;
        trace!(channel = %self.id, len = packet.len(), "UDP datagram sent");
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_one();
            debug!(session_id = self.session_id, channel = %self.id, "UDP channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receive client datagrams until the channel closes, feeding each one to
/// the tunnel. Returns the number of datagrams delivered.
pub async fn pump_datagrams(channel: Arc<UdpChannel>, tunnel: Arc<Tunnel>) -> Result<u64, TunnelError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut datagrams = 0u64;
    loop {
        tokio::select! {
            _ = channel.close_notify.notified() => break,
            received = channel.recv_packet(&mut buf) => match received {
                Ok(len) => {
                    tunnel.on_packets_received(vec![Bytes::copy_from_slice(&buf[..len])]);
                    datagrams += 1;
                }
                Err(TunnelError::ChannelClosed(_)) => break,
                Err(e) => return Err(e),
            },
        }
    }
    debug!(channel = %channel.id, datagrams, "UDP pump ended");
    Ok(datagrams)
}
