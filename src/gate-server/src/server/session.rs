//! Client session: one authorized client, its tunnel and its usage ledger.
//!
//! The session listens to its tunnel. Packets from the client go to the
//! forwarder; every traffic change may trigger a usage sync with the
//! access server. Syncs are spawned and never awaited by the trigger, and
//! at most one is in flight. Any non-Ok reply disposes the session.

use crate::access_server::AccessServer;
use crate::config::SessionOptions;
use crate::packet_forwarder::{PacketForwarder, SessionForwarder};
use crate::socket_factory::{AddressFamily, SocketFactory};
use crate::tunnel::{DatagramChannel, ListenerId, Tunnel, TunnelError, TunnelListener};
use crate::udp_channel::{pump_datagrams, UdpChannel};
use bytes::Bytes;
use gate_common::{
    random_key, ClientIdentity, CommonError, ResponseBase, SessionErrorCode, SessionId,
    SessionResponse, UdpChannelResponse, UsageInfo,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is disposed")]
    Disposed,

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {session_id} is closed: {code}")]
    Closed {
        session_id: SessionId,
        code: SessionErrorCode,
    },

    #[error("access server refused session: {0}")]
    Refused(SessionErrorCode),

    #[error("invalid session response: {0}")]
    InvalidResponse(#[from] CommonError),

    #[error("no tokio runtime to run session tasks")]
    NoRuntime,

    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dependencies shared by every session of a server.
#[derive(Clone)]
pub struct SessionEnv {
    pub access_server: Arc<dyn AccessServer>,
    pub socket_factory: Arc<dyn SocketFactory>,
    /// Queue of packets leaving towards the network
    pub network_tx: mpsc::Sender<Bytes>,
    pub options: SessionOptions,
}

#[derive(Debug, Default)]
struct SyncState {
    /// Usage already charged, client perspective
    reported: UsageInfo,
    syncing: bool,
    /// Close requested while a sync was in flight
    pending_close: bool,
}

/// Clears the syncing flag when the sync ends, however it ends.
struct SyncGuard<'a> {
    state: &'a Mutex<SyncState>,
    armed: bool,
}

impl<'a> SyncGuard<'a> {
    fn new(state: &'a Mutex<SyncState>) -> Self {
        Self { state, armed: true }
    }

    /// Record charged usage (if any) and release the flag. Returns whether
    /// a close was requested meanwhile.
    fn finish(mut self, charged: Option<UsageInfo>) -> bool {
        let mut state = self.state.lock();
        if let Some(usage) = charged {
            state.reported += usage;
        }
        state.syncing = false;
        self.armed = false;
        std::mem::take(&mut state.pending_close)
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().syncing = false;
        }
    }
}

/// Bridges tunnel callbacks to the session without keeping it alive.
struct SessionListener {
    session: Weak<Session>,
}

impl TunnelListener for SessionListener {
    fn on_packets_received(&self, packets: &[Bytes]) {
        if let Some(session) = self.session.upgrade() {
            if !session.is_disposed() {
                session.forwarder.send_packets(packets);
            }
        }
    }

    fn on_traffic_changed(&self) {
        if let Some(session) = self.session.upgrade() {
            session.spawn_sync(false);
        }
    }
}

pub struct Session {
    session_id: SessionId,
    session_key: Vec<u8>,
    identity: Option<ClientIdentity>,
    response: Mutex<ResponseBase>,
    access_server: Arc<dyn AccessServer>,
    socket_factory: Arc<dyn SocketFactory>,
    host_endpoint: SocketAddr,
    sync_cache_size: u64,
    tunnel: Arc<Tunnel>,
    forwarder: Box<dyn PacketForwarder>,
    udp_channel: Mutex<Option<Arc<UdpChannel>>>,
    udp_switch: tokio::sync::Mutex<()>,
    sync: Mutex<SyncState>,
    listener_id: ListenerId,
    runtime: Handle,
    created_at: Instant,
    disposed: AtomicBool,
}

impl Session {
    /// Build a session from the access server's reply. Must be called
    /// inside a tokio runtime; syncs are spawned onto it.
    pub fn new(
        env: &SessionEnv,
        response: SessionResponse,
        host_endpoint: SocketAddr,
        identity: Option<ClientIdentity>,
    ) -> Result<Arc<Self>, SessionError> {
        if !response.base.is_ok() {
            return Err(SessionError::Refused(response.base.error_code));
        }
        let session_key = response.require_session_key()?.to_vec();
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let options = &env.options;
        let tunnel = Arc::new(Tunnel::new(options.max_datagram_channel_count));
        let forwarder = SessionForwarder::new(tunnel.clone(), env.network_tx.clone())
            .with_ping_supported(options.ping_supported)
            .with_udp_flow_timeout(options.udp_flow_timeout())
            .with_max_udp_flows(options.max_udp_flow_count);

        let session = Arc::new_cyclic(|weak: &Weak<Session>| {
            let listener_id = tunnel.subscribe(Arc::new(SessionListener {
                session: weak.clone(),
            }));
            Session {
                session_id: response.session_id,
                session_key,
                identity,
                response: Mutex::new(response.base.clone()),
                access_server: env.access_server.clone(),
                socket_factory: env.socket_factory.clone(),
                host_endpoint,
                sync_cache_size: options.sync_cache_size,
                tunnel,
                forwarder: Box::new(forwarder),
                udp_channel: Mutex::new(None),
                udp_switch: tokio::sync::Mutex::new(()),
                sync: Mutex::new(SyncState::default()),
                listener_id,
                runtime,
                created_at: Instant::now(),
                disposed: AtomicBool::new(false),
            }
        });

        info!(session_id = session.session_id, "Session created");
        Ok(session)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Latest reply from the access server.
    pub fn response(&self) -> ResponseBase {
        self.response.lock().clone()
    }

    pub fn error_code(&self) -> SessionErrorCode {
        self.response.lock().error_code
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn host_endpoint(&self) -> SocketAddr {
        self.host_endpoint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Usage charged to the access server so far.
    pub fn reported_usage(&self) -> UsageInfo {
        self.sync.lock().reported
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.lock().syncing
    }

    /// True when the only datagram channel is this session's UDP channel.
    pub fn use_udp_channel(&self) -> bool {
        let channels = self.tunnel.datagram_channels();
        let udp = self.udp_channel.lock();
        match (channels.as_slice(), udp.as_ref()) {
            ([only], Some(udp)) => only.id() == udp.id(),
            _ => false,
        }
    }

    /// Switch between a dedicated UDP channel and datagrams over streams.
    ///
    /// Enabling replaces every datagram channel with a fresh UDP channel
    /// and a fresh key. Disabling only removes the UDP channel. Setting the
    /// current value does nothing.
    pub async fn set_use_udp_channel(&self, value: bool) -> Result<(), SessionError> {
        let _switch = self.udp_switch.lock().await;
        if value == self.use_udp_channel() {
            return Ok(());
        }
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }

        if value {
            let socket = self
                .socket_factory
                .create_udp_socket(AddressFamily::from(&self.host_endpoint))
                .await?;
            let channel = Arc::new(UdpChannel::new(socket, self.session_id, random_key())?);

            // Stream channel attaches take the same lock.
            {
                let mut udp = self.udp_channel.lock();
                for old in self.tunnel.datagram_channels() {
                    self.tunnel.remove_channel(old.id());
                }
                udp.take();
                self.tunnel.add_channel(channel.clone())?;
                *udp = Some(channel.clone());
            }

            let pump = pump_datagrams(channel.clone(), self.tunnel.clone());
            let session_id = self.session_id;
            self.runtime.spawn(async move {
                if let Err(e) = pump.await {
                    debug!(session_id, %e, "UDP channel receive failed");
                }
            });
            info!(
                session_id = self.session_id,
                port = channel.local_port(),
                "Session switched to UDP channel"
            );
        } else {
            let mut udp = self.udp_channel.lock();
            if let Some(old) = udp.take() {
                self.tunnel.remove_channel(old.id());
                info!(session_id = self.session_id, "Session left UDP channel");
            }
        }
        Ok(())
    }

    /// The session's UDP channel, while UDP mode is active.
    pub fn udp_channel(&self) -> Option<Arc<UdpChannel>> {
        if self.use_udp_channel() {
            self.udp_channel.lock().clone()
        } else {
            None
        }
    }

    /// Port and key the client needs for the UDP channel.
    pub fn udp_channel_response(&self) -> Option<UdpChannelResponse> {
        self.udp_channel().map(|channel| channel.response())
    }

    /// Attach a datagram channel carried over a stream. Leaves UDP mode
    /// first, since the two kinds never coexist.
    pub fn add_stream_datagram_channel(
        &self,
        channel: Arc<dyn DatagramChannel>,
    ) -> Result<(), SessionError> {
        if self.is_disposed() {
            channel.close();
            return Err(SessionError::Disposed);
        }
        let mut udp = self.udp_channel.lock();
        if let Some(old) = udp.take() {
            self.tunnel.remove_channel(old.id());
        }
        self.tunnel.add_channel(channel)?;
        Ok(())
    }

    pub fn tcp_connection_count(&self) -> usize {
        let datagram = if self.use_udp_channel() {
            0
        } else {
            self.tunnel.datagram_channel_count()
        };
        self.tunnel.stream_channel_count() + datagram
    }

    pub fn udp_connection_count(&self) -> usize {
        self.forwarder.udp_connection_count() + usize::from(self.use_udp_channel())
    }

    pub fn last_activity_time(&self) -> Instant {
        self.tunnel.last_activity_time()
    }

    /// Send a packet that arrived from the network to the client.
    pub async fn deliver_network_packet(&self, packet: Bytes) -> Result<(), SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        self.forwarder.deliver(packet).await?;
        Ok(())
    }

    /// Dispose and close the session on the access server.
    pub fn dispose(self: &Arc<Self>) {
        self.dispose_with(true);
    }

    /// Tear the session down. Idempotent. Issues one last usage sync;
    /// `close_session` decides whether it closes the session remotely.
    pub fn dispose_with(self: &Arc<Self>, close_session: bool) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tunnel.unsubscribe(self.listener_id);
        self.tunnel.dispose();
        self.forwarder.dispose();
        self.udp_channel.lock().take();
        info!(
            session_id = self.session_id,
            close_session,
            error_code = %self.error_code(),
            "Session disposed"
        );
        self.spawn_sync(close_session);
    }

    fn spawn_sync(self: &Arc<Self>, close_session: bool) {
        let Some(usage) = self.begin_sync(close_session) else {
            return;
        };
        let session = self.clone();
        self.runtime
            .spawn(async move { session.run_sync(usage, close_session).await });
    }

    /// Decide whether a sync is due and claim the syncing flag.
    fn begin_sync(&self, close_session: bool) -> Option<UsageInfo> {
        let mut state = self.sync.lock();
        if state.syncing {
            if close_session {
                state.pending_close = true;
                debug!(session_id = self.session_id, "Close deferred until current sync ends");
            }
            return None;
        }

        // Reversed on purpose: bytes the tunnel received were sent by the client.
        let usage = UsageInfo::new(
            self.tunnel
                .received_byte_count()
                .saturating_sub(state.reported.sent_traffic),
            self.tunnel
                .sent_byte_count()
                .saturating_sub(state.reported.received_traffic),
        );
        if !close_session && usage.total() < self.sync_cache_size {
            return None;
        }
        state.syncing = true;
        Some(usage)
    }

    async fn run_sync(self: Arc<Self>, usage: UsageInfo, close_session: bool) {
        let guard = SyncGuard::new(&self.sync);
        let result = self
            .access_server
            .add_usage(self.session_id, close_session, usage)
            .await;

        let pending_close = match result {
            Ok(response) => {
                let pending_close = guard.finish(Some(usage));
                let code = response.error_code;
                *self.response.lock() = response;
                debug!(
                    session_id = self.session_id,
                    sent = usage.sent_traffic,
                    received = usage.received_traffic,
                    close_session,
                    %code,
                    "Usage synced"
                );
                if !code.is_ok() {
                    info!(session_id = self.session_id, %code, "Access server ended session");
                    self.dispose_with(false);
                }
                pending_close
            }
            Err(e) => {
                warn!(session_id = self.session_id, %e, "Usage sync failed");
                guard.finish(None)
            }
        };

        if pending_close {
            self.spawn_sync(true);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
