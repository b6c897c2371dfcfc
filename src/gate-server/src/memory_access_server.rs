//! In-memory access server
//!
//! Keeps sessions, usage and certificates in process memory. Used by tests
//! and single-node deployments that do not talk to a remote authority.

use crate::access_server::{AccessError, AccessServer};
use async_trait::async_trait;
use gate_common::{
    random_key, AccessUsage, ClientIdentity, ResponseBase, SessionErrorCode, SessionId,
    SessionResponse, UsageInfo,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Access granted to one session
#[derive(Debug, Clone)]
struct AccessEntry {
    identity: ClientIdentity,
    usage: UsageInfo,
    max_traffic: Option<u64>,
    expires_at: Option<SystemTime>,
    closed: bool,
}

impl AccessEntry {
    fn access_usage(&self) -> AccessUsage {
        AccessUsage {
            usage: self.usage,
            max_traffic: self.max_traffic,
            expiration_time: self
                .expires_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        }
    }
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, AccessEntry>,
    certificates: HashMap<SocketAddr, Vec<u8>>,
    default_certificate: Option<Vec<u8>>,
    next_session_id: SessionId,
}

/// Access server keeping all state in memory.
pub struct MemoryAccessServer {
    state: Mutex<State>,
    maintenance: AtomicBool,
    add_usage_calls: AtomicU64,
    certificate_requests: AtomicU64,
}

impl MemoryAccessServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_session_id: 1,
                ..State::default()
            }),
            maintenance: AtomicBool::new(false),
            add_usage_calls: AtomicU64::new(0),
            certificate_requests: AtomicU64::new(0),
        }
    }

    /// Authorize a new session and issue its id and key.
    pub fn create_session(
        &self,
        identity: ClientIdentity,
        max_traffic: Option<u64>,
        lifetime: Option<Duration>,
    ) -> SessionResponse {
        let mut state = self.state.lock();
        let session_id = state.next_session_id;
        state.next_session_id = state.next_session_id.wrapping_add(1).max(1);

        let entry = AccessEntry {
            identity,
            usage: UsageInfo::default(),
            max_traffic,
            expires_at: lifetime.map(|l| SystemTime::now() + l),
            closed: false,
        };
        let access_usage = entry.access_usage();
        state.sessions.insert(session_id, entry);
        info!(session_id, "Access server created session");

        let mut response = SessionResponse::new(session_id, random_key().to_vec());
        response.base = response.base.with_access_usage(access_usage);
        response
    }

    /// Cumulative usage charged to a session.
    pub fn usage(&self, session_id: SessionId) -> Option<UsageInfo> {
        self.state.lock().sessions.get(&session_id).map(|e| e.usage)
    }

    /// Identity the session was created for.
    pub fn identity(&self, session_id: SessionId) -> Option<ClientIdentity> {
        self.state
            .lock()
            .sessions
            .get(&session_id)
            .map(|e| e.identity.clone())
    }

    pub fn is_session_closed(&self, session_id: SessionId) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session_id)
            .map(|e| e.closed)
            .unwrap_or(false)
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        let was = self.maintenance.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "Access server maintenance mode changed");
        }
    }

    /// Certificate served for a specific listening endpoint.
    pub fn set_certificate(&self, endpoint: SocketAddr, data: Vec<u8>) {
        self.state.lock().certificates.insert(endpoint, data);
    }

    /// Certificate served for endpoints without a specific one.
    pub fn set_default_certificate(&self, data: Vec<u8>) {
        self.state.lock().default_certificate = Some(data);
    }

    pub fn add_usage_calls(&self) -> u64 {
        self.add_usage_calls.load(Ordering::SeqCst)
    }

    pub fn certificate_requests(&self) -> u64 {
        self.certificate_requests.load(Ordering::SeqCst)
    }
}

impl Default for MemoryAccessServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessServer for MemoryAccessServer {
    async fn add_usage(
        &self,
        session_id: SessionId,
        close_session: bool,
        usage: UsageInfo,
    ) -> Result<ResponseBase, AccessError> {
        self.add_usage_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_maintenance_mode() {
            return Err(AccessError::Maintenance);
        }

        let mut state = self.state.lock();
        let Some(entry) = state.sessions.get_mut(&session_id) else {
            return Ok(ResponseBase::error(
                SessionErrorCode::GeneralError,
                format!("session {session_id} does not exist"),
            ));
        };

        if entry.closed {
            return Ok(
                ResponseBase::error(SessionErrorCode::SessionClosed, "session is closed")
                    .with_access_usage(entry.access_usage()),
            );
        }

        entry.usage += usage;
        if close_session {
            entry.closed = true;
        }
        debug!(
            session_id,
            sent = usage.sent_traffic,
            received = usage.received_traffic,
            close_session,
            "Usage charged"
        );

        let access_usage = entry.access_usage();
        if let Some(max) = entry.max_traffic {
            if entry.usage.total() > max {
                return Ok(ResponseBase::error(
                    SessionErrorCode::AccessTrafficOverflow,
                    "traffic quota exceeded",
                )
                .with_access_usage(access_usage));
            }
        }
        if let Some(expires_at) = entry.expires_at {
            if SystemTime::now() >= expires_at {
                return Ok(
                    ResponseBase::error(SessionErrorCode::AccessExpired, "access expired")
                        .with_access_usage(access_usage),
                );
            }
        }

        Ok(ResponseBase::ok().with_access_usage(access_usage))
    }

    fn is_maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    async fn get_ssl_certificate_data(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Vec<u8>, AccessError> {
        self.certificate_requests.fetch_add(1, Ordering::SeqCst);
        if self.is_maintenance_mode() {
            return Err(AccessError::Maintenance);
        }

        let state = self.state.lock();
        state
            .certificates
            .get(&endpoint)
            .or(state.default_certificate.as_ref())
            .cloned()
            .ok_or(AccessError::CertificateNotFound(endpoint))
    }
}
