//! Server options
//!
//! Loaded from JSON. Every field has a default so a partial (or empty)
//! object is a valid configuration. Durations are whole seconds.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Unreported traffic (bytes) that triggers a usage sync.
pub const DEFAULT_SYNC_CACHE_SIZE: u64 = 100 * 1_000_000;
pub const DEFAULT_MAX_DATAGRAM_CHANNEL_COUNT: usize = 8;
pub const DEFAULT_UDP_FLOW_TIMEOUT_SECS: u64 = 120;
/// UDP flows tracked per session before the oldest is forgotten
pub const DEFAULT_MAX_UDP_FLOW_COUNT: usize = 1024;
/// Idle sessions are disposed after this long (5 minutes)
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAINTENANCE_CHECK_INTERVAL_SECS: u64 = 60;

/// Per-session behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Bytes of unreported traffic tolerated before syncing with the access server
    pub sync_cache_size: u64,
    /// Datagram channels a tunnel keeps before evicting the oldest
    pub max_datagram_channel_count: usize,
    pub udp_flow_timeout_secs: u64,
    pub max_udp_flow_count: usize,
    pub session_idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Forward ICMP echo from clients
    pub ping_supported: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sync_cache_size: DEFAULT_SYNC_CACHE_SIZE,
            max_datagram_channel_count: DEFAULT_MAX_DATAGRAM_CHANNEL_COUNT,
            udp_flow_timeout_secs: DEFAULT_UDP_FLOW_TIMEOUT_SECS,
            max_udp_flow_count: DEFAULT_MAX_UDP_FLOW_COUNT,
            session_idle_timeout_secs: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            ping_supported: true,
        }
    }
}

impl SessionOptions {
    pub fn udp_flow_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_flow_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Set the sync threshold
    pub fn with_sync_cache_size(mut self, bytes: u64) -> Self {
        self.sync_cache_size = bytes;
        self
    }

    pub fn with_max_datagram_channel_count(mut self, count: usize) -> Self {
        self.max_datagram_channel_count = count;
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout_secs = timeout.as_secs();
        self
    }
}

/// Certificate cache behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateCacheOptions {
    /// Zero disables caching (test mode)
    pub maintenance_check_interval_secs: u64,
}

impl Default for CertificateCacheOptions {
    fn default() -> Self {
        Self {
            maintenance_check_interval_secs: DEFAULT_MAINTENANCE_CHECK_INTERVAL_SECS,
        }
    }
}

impl CertificateCacheOptions {
    pub fn maintenance_check_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_check_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub session: SessionOptions,
    pub certificates: CertificateCacheOptions,
}

impl ServerOptions {
    /// Load options from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading server options {:?}", path))?;
        Self::from_json(&data).with_context(|| format!("loading server options {:?}", path))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(data).context("parsing server options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing server options")
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.max_datagram_channel_count == 0 {
            bail!("session.max_datagram_channel_count must be at least 1");
        }
        if self.session.max_udp_flow_count == 0 {
            bail!("session.max_udp_flow_count must be at least 1");
        }
        if self.session.cleanup_interval_secs == 0 {
            bail!("session.cleanup_interval_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let options = ServerOptions::from_json("{}").unwrap();
        assert_eq!(options, ServerOptions::default());
        assert_eq!(options.session.sync_cache_size, DEFAULT_SYNC_CACHE_SIZE);
        assert_eq!(
            options.certificates.maintenance_check_interval(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_partial_override() {
        let options = ServerOptions::from_json(
            r#"{"session": {"sync_cache_size": 0, "ping_supported": false},
                "certificates": {"maintenance_check_interval_secs": 0}}"#,
        )
        .unwrap();
        assert_eq!(options.session.sync_cache_size, 0);
        assert!(!options.session.ping_supported);
        assert_eq!(
            options.session.max_datagram_channel_count,
            DEFAULT_MAX_DATAGRAM_CHANNEL_COUNT
        );
        assert!(options.certificates.maintenance_check_interval().is_zero());
    }

    #[test]
    fn test_rejects_zero_channel_count() {
        let err = ServerOptions::from_json(r#"{"session": {"max_datagram_channel_count": 0}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("max_datagram_channel_count"));
    }

    #[test]
    fn test_rejects_zero_udp_flow_count() {
        let err = ServerOptions::from_json(r#"{"session": {"max_udp_flow_count": 0}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("max_udp_flow_count"));
        assert_eq!(SessionOptions::default().max_udp_flow_count, DEFAULT_MAX_UDP_FLOW_COUNT);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"session": {{"session_idle_timeout_secs": 30}}}}"#).unwrap();

        let options = ServerOptions::load(file.path()).unwrap();
        assert_eq!(options.session.session_idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = ServerOptions::load("/nonexistent/gate.json").unwrap_err();
        assert!(format!("{err:#}").contains("reading server options"));
    }

    #[test]
    fn test_json_roundtrip() {
        let options = ServerOptions {
            session: SessionOptions::default().with_sync_cache_size(42),
            ..ServerOptions::default()
        };
        let parsed = ServerOptions::from_json(&options.to_json().unwrap()).unwrap();
        assert_eq!(parsed, options);
    }
}
