//! Client and session identity.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Server-issued numeric session handle.
pub type SessionId = u32;

/// Who is behind a session: the access token used and the client device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Access token the client authenticated with
    pub token_id: Uuid,
    /// Optional user-facing token string
    #[serde(default)]
    pub user_token: Option<String>,
    /// Stable identifier of the client installation
    pub client_id: Uuid,
    /// Address the client connected from
    pub client_ip: IpAddr,
}

impl ClientIdentity {
    pub fn new(token_id: Uuid, client_id: Uuid, client_ip: IpAddr) -> Self {
        Self {
            token_id,
            user_token: None,
            client_id,
            client_ip,
        }
    }

    pub fn with_user_token(mut self, user_token: impl Into<String>) -> Self {
        self.user_token = Some(user_token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_identity_json() {
        let identity = ClientIdentity::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        )
        .with_user_token("alice");
        let json = serde_json::to_string(&identity).unwrap();
        let parsed: ClientIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
        assert_eq!(parsed.user_token.as_deref(), Some("alice"));
    }
}
