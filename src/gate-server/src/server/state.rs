//! Server state management for client sessions.

use super::session::{Session, SessionEnv, SessionError};
use gate_common::{ClientIdentity, SessionErrorCode, SessionId, SessionResponse};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// All live sessions of a server, indexed by session id
pub struct SessionManager {
    env: SessionEnv,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(env: SessionEnv) -> Self {
        Self {
            env,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    /// Create a session from an access server reply. A previous session
    /// with the same id is disposed (without closing it remotely) and
    /// replaced.
    pub fn create_session(
        &self,
        response: SessionResponse,
        host_endpoint: SocketAddr,
        identity: Option<ClientIdentity>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Session::new(&self.env, response, host_endpoint, identity)?;
        let previous = self
            .sessions
            .write()
            .insert(session.session_id(), session.clone());
        if let Some(previous) = previous {
            debug!(session_id = previous.session_id(), "Replacing existing session");
            previous.dispose_with(false);
        }
        Ok(session)
    }

    /// Look up a live session. A disposed session reports why it ended.
    pub fn get_session(&self, session_id: SessionId) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::NotFound(session_id))?;

        if session.is_disposed() {
            let code = match session.error_code() {
                SessionErrorCode::Ok => SessionErrorCode::SessionClosed,
                code => code,
            };
            return Err(SessionError::Closed { session_id, code });
        }
        Ok(session)
    }

    /// Dispose a session and close it on the access server.
    pub fn close_session(&self, session_id: SessionId) -> bool {
        let session = self.sessions.write().remove(&session_id);
        match session {
            Some(session) => {
                session.dispose();
                true
            }
            None => false,
        }
    }

    /// Forget sessions that are already disposed. Returns how many.
    pub fn remove_disposed(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_disposed());
        before - sessions.len()
    }

    /// Dispose sessions idle for longer than the configured timeout, then
    /// forget every disposed session. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let timeout = self.env.options.session_idle_timeout();
        let idle: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_disposed() && s.last_activity_time().elapsed() > timeout)
            .cloned()
            .collect();

        for session in &idle {
            debug!(session_id = session.session_id(), "Session idle, disposing");
            session.dispose();
        }

        let removed = self.remove_disposed();
        if removed > 0 {
            debug!(removed, idle = idle.len(), "Sessions cleaned up");
        }
        removed
    }

    /// Dispose every session (shutdown).
    pub fn dispose_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.dispose();
        }
        info!(count = sessions.len(), "All sessions disposed");
    }

    /// Live (not yet disposed) sessions.
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_disposed())
            .count()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}

/// Periodic idle-session cleanup until shutdown; disposes everything on exit.
pub async fn session_cleanup_task(
    manager: Arc<SessionManager>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.cleanup();
            }
            _ = shutdown.recv() => {
                info!("Session cleanup task shutting down");
                break;
            }
        }
    }
    manager.dispose_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::memory_access_server::MemoryAccessServer;
    use crate::socket_factory::DefaultSocketFactory;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn manager(server: Arc<MemoryAccessServer>, options: SessionOptions) -> SessionManager {
        let (network_tx, _network_rx) = mpsc::channel(16);
        SessionManager::new(SessionEnv {
            access_server: server,
            socket_factory: Arc::new(DefaultSocketFactory),
            network_tx,
            options,
        })
    }

    fn identity() -> ClientIdentity {
        ClientIdentity::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
        )
    }

    fn host() -> SocketAddr {
        "127.0.0.1:443".parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let server = Arc::new(MemoryAccessServer::new());
        let manager = manager(server.clone(), SessionOptions::default());
        let response = server.create_session(identity(), None, None);
        let id = response.session_id;

        let session = manager.create_session(response, host(), Some(identity())).unwrap();
        assert!(Arc::ptr_eq(&session, &manager.get_session(id).unwrap()));
        assert_eq!(manager.session_count(), 1);
        assert!(matches!(
            manager.get_session(id + 100),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disposed_session_reports_closed() {
        let server = Arc::new(MemoryAccessServer::new());
        let manager = manager(server.clone(), SessionOptions::default());
        let response = server.create_session(identity(), None, None);
        let id = response.session_id;

        let session = manager.create_session(response, host(), None).unwrap();
        session.dispose();
        assert!(matches!(
            manager.get_session(id),
            Err(SessionError::Closed {
                code: SessionErrorCode::SessionClosed,
                ..
            })
        ));
        assert_eq!(manager.remove_disposed(), 1);
        assert!(matches!(manager.get_session(id), Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_disposes_idle_sessions() {
        let server = Arc::new(MemoryAccessServer::new());
        let options = SessionOptions::default().with_session_idle_timeout(Duration::ZERO);
        let manager = manager(server.clone(), options);
        let response = server.create_session(identity(), None, None);
        let session = manager.create_session(response, host(), None).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.cleanup(), 1);
        assert!(session.is_disposed());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_disposes_all_on_shutdown() {
        let server = Arc::new(MemoryAccessServer::new());
        let manager = Arc::new(manager(server.clone(), SessionOptions::default()));
        let response = server.create_session(identity(), None, None);
        let session = manager.create_session(response, host(), None).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(session_cleanup_task(
            manager.clone(),
            Duration::from_secs(60),
            shutdown_rx,
        ));
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert!(session.is_disposed());
        assert!(manager.sessions().is_empty());
    }
}
