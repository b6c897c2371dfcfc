//! Session tunnel: the set of channels carrying one client's packets.
//!
//! A tunnel owns zero or more datagram channels (a dedicated UDP channel or
//! datagram flows carried over stream connections) and counts the stream
//! channels attached to it. It keeps cumulative byte counters and notifies
//! registered [`TunnelListener`]s when packets arrive and when the counters
//! move.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum payload per frame to keep memory predictable.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Default cap on concurrently attached datagram channels.
pub const DEFAULT_MAX_DATAGRAM_CHANNELS: usize = 8;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// How a datagram channel moves packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Dedicated UDP socket
    Udp,
    /// Datagrams framed over a stream connection
    Stream,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel is disposed")]
    Disposed,

    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    #[error("no datagram channel available")]
    NoChannel,

    #[error("channel {0} has no remote endpoint yet")]
    NoRemote(ChannelId),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A channel able to carry IP packets to the client.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn kind(&self) -> ChannelKind;

    /// Send one IP packet to the client.
    async fn send_packet(&self, packet: Bytes) -> Result<(), TunnelError>;

    /// Close the channel; later sends fail with [`TunnelError::ChannelClosed`].
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Receives tunnel notifications.
///
/// Callbacks run on the caller's task and must not block.
pub trait TunnelListener: Send + Sync {
    /// IP packets arrived from the client.
    fn on_packets_received(&self, packets: &[Bytes]);

    /// Sent or received byte counters changed.
    fn on_traffic_changed(&self);
}

/// Handle returned by [`Tunnel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Multiplexed channel set of one session.
pub struct Tunnel {
    datagram_channels: RwLock<Vec<Arc<dyn DatagramChannel>>>,
    max_datagram_channels: usize,
    stream_channel_count: AtomicUsize,
    received_bytes: AtomicU64,
    sent_bytes: AtomicU64,
    last_activity: Mutex<Instant>,
    listeners: Mutex<HashMap<ListenerId, Arc<dyn TunnelListener>>>,
    next_listener_id: AtomicU64,
    next_channel: AtomicUsize,
    disposed: AtomicBool,
}

impl Tunnel {
    pub fn new(max_datagram_channels: usize) -> Self {
        Self {
            datagram_channels: RwLock::new(Vec::new()),
            max_datagram_channels: max_datagram_channels.max(1),
            stream_channel_count: AtomicUsize::new(0),
            received_bytes: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            next_channel: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Register a listener; keep the id to unsubscribe.
    pub fn subscribe(&self, listener: Arc<dyn TunnelListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    /// Deregister a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Attach a datagram channel. When the cap is reached the oldest
    /// datagram channel is closed and detached.
    pub fn add_channel(&self, channel: Arc<dyn DatagramChannel>) -> Result<(), TunnelError> {
        if self.is_disposed() {
            channel.close();
            return Err(TunnelError::Disposed);
        }

        let evicted = {
            let mut channels = self.datagram_channels.write();
            channels.push(channel.clone());
            let excess = channels.len().saturating_sub(self.max_datagram_channels);
            let evicted: Vec<_> = channels.drain(..excess).collect();
            evicted
        };
        for old in evicted {
            debug!(channel = %old.id(), "Datagram channel limit reached, closing oldest");
            old.close();
        }

        debug!(channel = %channel.id(), kind = ?channel.kind(), "Datagram channel added");
        self.touch();
        Ok(())
    }

    /// Detach and close a datagram channel.
    pub fn remove_channel(&self, id: ChannelId) -> bool {
        let removed = {
            let mut channels = self.datagram_channels.write();
            let position = channels.iter().position(|c| c.id() == id);
            position.map(|pos| channels.remove(pos))
        };
        match removed {
            Some(channel) => {
                channel.close();
                debug!(channel = %id, "Datagram channel removed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the attached datagram channels, oldest first.
    pub fn datagram_channels(&self) -> Vec<Arc<dyn DatagramChannel>> {
        self.datagram_channels.read().clone()
    }

    pub fn datagram_channel_count(&self) -> usize {
        self.datagram_channels.read().len()
    }

    /// Record a newly attached stream channel.
    pub fn add_stream_channel(&self) {
        self.stream_channel_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a detached stream channel.
    pub fn remove_stream_channel(&self) {
        let _ = self
            .stream_channel_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn stream_channel_count(&self) -> usize {
        self.stream_channel_count.load(Ordering::Relaxed)
    }

    /// Bytes received from the client since construction.
    pub fn received_byte_count(&self) -> u64 {
        self.received_bytes.load(Ordering::SeqCst)
    }

    /// Bytes sent to the client since construction.
    pub fn sent_byte_count(&self) -> u64 {
        self.sent_bytes.load(Ordering::SeqCst)
    }

    pub fn last_activity_time(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Send one packet to the client over the datagram channels (round robin).
    pub async fn send_packet(&self, packet: Bytes) -> Result<(), TunnelError> {
        if self.is_disposed() {
            return Err(TunnelError::Disposed);
        }

        let channel = {
            let channels = self.datagram_channels.read();
            if channels.is_empty() {
                return Err(TunnelError::NoChannel);
            }
            let index = self.next_channel.fetch_add(1, Ordering::Relaxed) % channels.len();
            channels[index].clone()
        };

        let len = packet.len() as u64;
        channel.send_packet(packet).await?;
        self.sent_bytes.fetch_add(len, Ordering::SeqCst);
        self.touch();
        trace!(channel = %channel.id(), len, "Packet sent to client");
        self.notify_traffic_changed();
        Ok(())
    }

    /// Entry point for channel readers: packets arrived from the client.
    pub fn on_packets_received(&self, packets: Vec<Bytes>) {
        if self.is_disposed() || packets.is_empty() {
            return;
        }

        let len: u64 = packets.iter().map(|p| p.len() as u64).sum();
        self.received_bytes.fetch_add(len, Ordering::SeqCst);
        self.touch();
        trace!(count = packets.len(), len, "Packets received from client");

        for listener in self.listeners_snapshot() {
            listener.on_packets_received(&packets);
        }
        self.notify_traffic_changed();
    }

    /// Close every channel and drop all listeners. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels = std::mem::take(&mut *self.datagram_channels.write());
        for channel in &channels {
            channel.close();
        }
        self.stream_channel_count.store(0, Ordering::Relaxed);
        self.listeners.lock().clear();
        debug!(closed = channels.len(), "Tunnel disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn notify_traffic_changed(&self) {
        for listener in self.listeners_snapshot() {
            listener.on_traffic_changed();
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn TunnelListener>> {
        self.listeners.lock().values().cloned().collect()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATAGRAM_CHANNELS)
    }
}

/// Read a length-prefixed frame (u16 big-endian). `None` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, TunnelError> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write a length-prefixed frame (u16 big-endian).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), TunnelError> {
    let len = data.len();
    if len > MAX_FRAME {
        return Err(TunnelError::FrameTooLarge(len));
    }
    let len_buf = (len as u16).to_be_bytes();
    writer.write_all(&len_buf).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
