//! # gate-server
//!
//! Session core of the gate VPN server.
//!
//! ## Architecture
//!
//! ```text
//! client ──┬── UDP channel ─────────┐
//!          └── stream channels ─────┤
//!                                   ▼
//!                              ┌─────────┐  packets   ┌───────────┐
//!                              │ Tunnel  │──────────▶│ Forwarder │──▶ network
//!                              └────┬────┘◀──────────└───────────┘
//!                        traffic    │
//!                        changed    ▼
//!                              ┌─────────┐  add_usage ┌───────────────┐
//!                              │ Session │──────────▶│ Access server │
//!                              └─────────┘            └───────────────┘
//! ```
//!
//! A [`Session`](server::Session) reconciles its tunnel's byte counters
//! with the access server and disposes itself when the access server says
//! so. The [`CertificateCache`](cert_manager::CertificateCache) resolves the
//! TLS certificate for each listening endpoint and falls back to a
//! self-signed certificate while the access server is in maintenance.

/// Access server contract
pub mod access_server;
/// Per-endpoint TLS certificate cache with maintenance fallback
pub mod cert_manager;
/// Server options (JSON)
pub mod config;
/// In-memory access server
pub mod memory_access_server;
pub mod packet;
/// Tunnel to network packet forwarding
pub mod packet_forwarder;
/// Sessions, session registry and TLS setup
pub mod server;
pub mod socket_factory;
/// Datagram channel over a stream connection
pub mod stream_channel;
/// Channel multiplexing and traffic counters
pub mod tunnel;
/// Dedicated UDP datagram channel
pub mod udp_channel;

pub use access_server::{AccessError, AccessServer};
pub use cert_manager::{CertificateCache, CertificateError, ServerCertificate};
pub use config::{CertificateCacheOptions, ServerOptions, SessionOptions};
pub use memory_access_server::MemoryAccessServer;
pub use packet_forwarder::{PacketForwarder, SessionForwarder};
pub use server::{Session, SessionEnv, SessionError, SessionManager};
pub use socket_factory::{AddressFamily, BoundSocketFactory, DefaultSocketFactory, SocketFactory};
pub use stream_channel::{pump_frames, StreamDatagramChannel};
pub use tunnel::{ChannelId, ChannelKind, DatagramChannel, Tunnel, TunnelError, TunnelListener};
pub use udp_channel::UdpChannel;
