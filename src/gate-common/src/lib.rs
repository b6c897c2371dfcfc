//! # gate-common
//!
//! Types shared between the gate server and its access servers: the
//! response envelope and error codes, usage accounting, client identity,
//! secure randomness for channel keys, and self-signed certificates.

pub mod error;
pub mod identity;
pub mod messaging;
pub mod pki;
pub mod rng;

pub use error::{CommonError, Result};
pub use identity::{ClientIdentity, SessionId};
pub use messaging::{
    AccessUsage, ResponseBase, SessionErrorCode, SessionResponse, UdpChannelResponse, UsageInfo,
};
pub use pki::{generate_maintenance_cert, generate_self_signed, SelfSignedCert, MAINTENANCE_UNIT};
pub use rng::{random_dns_name, random_key, CHANNEL_KEY_LEN};
