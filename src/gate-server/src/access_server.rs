//! Access server contract
//!
//! The access server (authority) authorizes sessions, charges their traffic
//! against quotas and hands out TLS certificates per listening endpoint.
//! Concrete implementations live outside the session core; the in-memory
//! [`MemoryAccessServer`](crate::memory_access_server::MemoryAccessServer)
//! doubles as reference implementation and test authority.

use async_trait::async_trait;
use gate_common::{ResponseBase, SessionId, UsageInfo};
use std::net::SocketAddr;
use thiserror::Error;

/// Failure of an access server call.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Access server is in maintenance and cannot serve the request
    #[error("access server is in maintenance mode")]
    Maintenance,

    /// No certificate is configured for the endpoint
    #[error("no certificate for endpoint {0}")]
    CertificateNotFound(SocketAddr),

    /// Request could not be delivered or the reply could not be read
    #[error("access server transport error: {0}")]
    Transport(String),

    /// Access server rejected the request
    #[error("access server rejected request: {0}")]
    Rejected(String),
}

impl AccessError {
    pub fn is_maintenance(&self) -> bool {
        matches!(self, AccessError::Maintenance)
    }
}

/// Operations the session core needs from the access server.
#[async_trait]
pub trait AccessServer: Send + Sync {
    /// Charge `usage` to the session; with `close_session` the session is
    /// closed on the access server after charging.
    async fn add_usage(
        &self,
        session_id: SessionId,
        close_session: bool,
        usage: UsageInfo,
    ) -> Result<ResponseBase, AccessError>;

    /// Whether the access server currently advertises maintenance mode.
    fn is_maintenance_mode(&self) -> bool;

    /// PEM certificate chain and private key for a listening endpoint.
    async fn get_ssl_certificate_data(&self, endpoint: SocketAddr)
        -> Result<Vec<u8>, AccessError>;
}
