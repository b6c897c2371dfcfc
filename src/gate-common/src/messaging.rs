//! Messages exchanged with the access server.
//!
//! Wire format is JSON; error codes travel as their variant names
//! (`"AccessTrafficOverflow"`), matching what access servers emit.

use crate::identity::SessionId;
use crate::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::ops::{Add, AddAssign};

/// Outcome classification for session-affecting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionErrorCode {
    #[default]
    Ok,
    GeneralError,
    SessionClosed,
    /// Another session of the same access took precedence
    SessionSuppressedBy,
    AccessExpired,
    /// Traffic quota exceeded
    AccessTrafficOverflow,
    Maintenance,
    RedirectHost,
    UnsupportedClient,
    UnsupportedServer,
}

impl SessionErrorCode {
    pub fn is_ok(self) -> bool {
        self == SessionErrorCode::Ok
    }
}

impl std::fmt::Display for SessionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "Ok",
            Self::GeneralError => "GeneralError",
            Self::SessionClosed => "SessionClosed",
            Self::SessionSuppressedBy => "SessionSuppressedBy",
            Self::AccessExpired => "AccessExpired",
            Self::AccessTrafficOverflow => "AccessTrafficOverflow",
            Self::Maintenance => "Maintenance",
            Self::RedirectHost => "RedirectHost",
            Self::UnsupportedClient => "UnsupportedClient",
            Self::UnsupportedServer => "UnsupportedServer",
        };
        f.write_str(name)
    }
}

/// Traffic usage in bytes, seen from the client's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    /// Bytes sent by the client
    pub sent_traffic: u64,
    /// Bytes received by the client
    pub received_traffic: u64,
}

impl UsageInfo {
    pub fn new(sent_traffic: u64, received_traffic: u64) -> Self {
        Self {
            sent_traffic,
            received_traffic,
        }
    }

    /// Sent plus received bytes
    pub fn total(&self) -> u64 {
        self.sent_traffic.saturating_add(self.received_traffic)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Add for UsageInfo {
    type Output = UsageInfo;

    fn add(self, rhs: UsageInfo) -> UsageInfo {
        UsageInfo {
            sent_traffic: self.sent_traffic.saturating_add(rhs.sent_traffic),
            received_traffic: self.received_traffic.saturating_add(rhs.received_traffic),
        }
    }
}

impl AddAssign for UsageInfo {
    fn add_assign(&mut self, rhs: UsageInfo) {
        *self = *self + rhs;
    }
}

/// Access usage snapshot returned alongside responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUsage {
    /// Cumulative usage charged to the access
    pub usage: UsageInfo,
    /// Traffic quota in bytes, `None` for unlimited
    #[serde(default)]
    pub max_traffic: Option<u64>,
    /// Expiration as UNIX seconds, `None` for no expiry
    #[serde(default)]
    pub expiration_time: Option<u64>,
}

/// Common reply envelope of the access server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBase {
    pub error_code: SessionErrorCode,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Set with `SessionSuppressedBy`: the session that took over
    #[serde(default)]
    pub suppressed_by: Option<SessionId>,
    /// Set with `RedirectHost`: where the client should reconnect
    #[serde(default)]
    pub redirect_host_endpoint: Option<SocketAddr>,
    #[serde(default)]
    pub access_usage: Option<AccessUsage>,
}

impl ResponseBase {
    /// Successful reply without any extra state.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Failed reply carrying `error_code` and a human-readable message.
    pub fn error(error_code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_access_usage(mut self, access_usage: AccessUsage) -> Self {
        self.access_usage = Some(access_usage);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error_code.is_ok()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Reply to a successful session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub session_id: SessionId,
    /// Symmetric key for the session's channel encryption
    #[serde(default)]
    pub session_key: Option<Vec<u8>>,
}

impl SessionResponse {
    pub fn new(session_id: SessionId, session_key: Vec<u8>) -> Self {
        Self {
            base: ResponseBase::ok(),
            session_id,
            session_key: Some(session_key),
        }
    }

    /// Session key, rejecting replies that omit it.
    pub fn require_session_key(&self) -> Result<&[u8]> {
        match self.session_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(CommonError::InvalidResponse(format!(
                "session {} response does not carry a session key",
                self.session_id
            ))),
        }
    }
}

/// Reply describing the dedicated UDP channel of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpChannelResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub udp_port: u16,
    pub udp_key: Vec<u8>,
}

impl UdpChannelResponse {
    pub fn new(base: ResponseBase, udp_port: u16, udp_key: Vec<u8>) -> Self {
        Self {
            base,
            udp_port,
            udp_key,
        }
    }
}
