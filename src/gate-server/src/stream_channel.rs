//! Datagrams tunneled over a stream connection.
//!
//! Each IP packet travels as one length-prefixed frame (u16 big-endian).
//! The write half becomes a [`DatagramChannel`]; the read half is drained
//! by [`pump_frames`] into the session's tunnel.

use crate::tunnel::{read_frame, write_frame, ChannelId, ChannelKind, DatagramChannel, Tunnel, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, trace};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Datagram channel writing frames to a stream.
pub struct StreamDatagramChannel {
    id: ChannelId,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl StreamDatagramChannel {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: ChannelId::next(),
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DatagramChannel for StreamDatagramChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    async fn send_packet(&self, packet: Bytes) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed(self.id));
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &packet).await
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(channel = %self.id, "Stream datagram channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Read frames until EOF and hand each one to the tunnel.
///
/// Returns the number of frames delivered. Stops early once the tunnel is
/// disposed.
pub async fn pump_frames<R>(mut reader: R, tunnel: Arc<Tunnel>) -> Result<u64, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = 0u64;
    while let Some(frame) = read_frame(&mut reader).await? {
        if tunnel.is_disposed() {
            break;
        }
        trace!(len = frame.len(), "Frame received from stream");
        tunnel.on_packets_received(vec![Bytes::from(frame)]);
        frames += 1;
    }
    debug!(frames, "Stream frame pump ended");
    Ok(frames)
}
