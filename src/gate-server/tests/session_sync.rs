//! Usage synchronization between sessions and the access server.

use async_trait::async_trait;
use bytes::Bytes;
use gate_common::{ClientIdentity, ResponseBase, SessionErrorCode, SessionId, UsageInfo};
use gate_server::{
    AccessError, AccessServer, DefaultSocketFactory, MemoryAccessServer, Session, SessionEnv,
    SessionOptions, StreamDatagramChannel,
};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn identity() -> ClientIdentity {
    ClientIdentity::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)),
    )
}

fn host() -> SocketAddr {
    "127.0.0.1:443".parse().unwrap()
}

fn env(access_server: Arc<dyn AccessServer>, sync_cache_size: u64) -> SessionEnv {
    let (network_tx, _network_rx) = mpsc::channel(1024);
    SessionEnv {
        access_server,
        socket_factory: Arc::new(DefaultSocketFactory),
        network_tx,
        options: SessionOptions::default().with_sync_cache_size(sync_cache_size),
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn packet(len: usize) -> Bytes {
    Bytes::from(vec![0u8; len])
}

/// Access server whose `add_usage` blocks until permits are released.
struct GatedAccessServer {
    inner: MemoryAccessServer,
    gate: Semaphore,
}

#[async_trait]
impl AccessServer for GatedAccessServer {
    async fn add_usage(
        &self,
        session_id: SessionId,
        close_session: bool,
        usage: UsageInfo,
    ) -> Result<ResponseBase, AccessError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| AccessError::Transport(e.to_string()))?
            .forget();
        self.inner.add_usage(session_id, close_session, usage).await
    }

    fn is_maintenance_mode(&self) -> bool {
        self.inner.is_maintenance_mode()
    }

    async fn get_ssl_certificate_data(&self, endpoint: SocketAddr) -> Result<Vec<u8>, AccessError> {
        self.inner.get_ssl_certificate_data(endpoint).await
    }
}

/// Access server failing every call while `failing` is set.
struct FlakyAccessServer {
    inner: MemoryAccessServer,
    failing: AtomicBool,
}

#[async_trait]
impl AccessServer for FlakyAccessServer {
    async fn add_usage(
        &self,
        session_id: SessionId,
        close_session: bool,
        usage: UsageInfo,
    ) -> Result<ResponseBase, AccessError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AccessError::Transport("connection reset".into()));
        }
        self.inner.add_usage(session_id, close_session, usage).await
    }

    fn is_maintenance_mode(&self) -> bool {
        false
    }

    async fn get_ssl_certificate_data(&self, endpoint: SocketAddr) -> Result<Vec<u8>, AccessError> {
        self.inner.get_ssl_certificate_data(endpoint).await
    }
}

#[tokio::test]
async fn test_usage_accumulates_across_syncs() {
    let server = Arc::new(MemoryAccessServer::new());
    let response = server.create_session(identity(), None, None);
    let id = response.session_id;
    let session = Session::new(&env(server.clone(), 30), response, host(), None).unwrap();
    session
        .add_stream_datagram_channel(Arc::new(StreamDatagramChannel::new(tokio::io::sink())))
        .unwrap();

    for round in 1..=2u64 {
        // 20 bytes from the client stay below the threshold; 10 more to it crosses it.
        session.tunnel().on_packets_received(vec![packet(20)]);
        session.tunnel().send_packet(packet(10)).await.unwrap();
        wait_until("usage sync", || {
            server.usage(id) == Some(UsageInfo::new(20 * round, 10 * round)) && !session.is_syncing()
        })
        .await;
    }

    assert_eq!(server.usage(id), Some(UsageInfo::new(40, 20)));
    assert_eq!(session.reported_usage(), UsageInfo::new(40, 20));
    assert_eq!(server.add_usage_calls(), 2);
}

#[tokio::test]
async fn test_traffic_overflow_disposes_session() {
    let server = Arc::new(MemoryAccessServer::new());
    let response = server.create_session(identity(), Some(50), None);
    let session = Session::new(&env(server.clone(), 0), response, host(), None).unwrap();

    session.tunnel().on_packets_received(vec![packet(60)]);
    wait_until("disposal", || session.is_disposed()).await;

    assert_eq!(session.error_code(), SessionErrorCode::AccessTrafficOverflow);
    assert!(session.tunnel().is_disposed());
}

#[tokio::test]
async fn test_close_during_sync_is_deferred_not_dropped() {
    init_tracing();
    let server = Arc::new(GatedAccessServer {
        inner: MemoryAccessServer::new(),
        gate: Semaphore::new(0),
    });
    let response = server.inner.create_session(identity(), None, None);
    let id = response.session_id;
    let session = Session::new(&env(server.clone(), 0), response, host(), None).unwrap();

    session.tunnel().on_packets_received(vec![packet(7)]);
    assert!(session.is_syncing());

    // More traffic while the first sync is blocked is not charged yet.
    session.tunnel().on_packets_received(vec![packet(5)]);
    session.dispose();
    assert!(session.is_disposed());

    server.gate.add_permits(8);
    wait_until("remote close", || server.inner.is_session_closed(id)).await;

    assert_eq!(server.inner.usage(id), Some(UsageInfo::new(12, 0)));
    assert_eq!(server.inner.add_usage_calls(), 2);
    wait_until("sync flag release", || !session.is_syncing()).await;
}

#[tokio::test]
async fn test_failed_sync_releases_flag_and_keeps_delta() {
    init_tracing();
    let server = Arc::new(FlakyAccessServer {
        inner: MemoryAccessServer::new(),
        failing: AtomicBool::new(true),
    });
    let response = server.inner.create_session(identity(), None, None);
    let id = response.session_id;
    let session = Session::new(&env(server.clone(), 0), response, host(), None).unwrap();

    session.tunnel().on_packets_received(vec![packet(9)]);
    wait_until("failed sync", || !session.is_syncing()).await;
    assert_eq!(session.reported_usage(), UsageInfo::default());
    assert!(!session.is_disposed());

    server.failing.store(false, Ordering::SeqCst);
    session.tunnel().on_packets_received(vec![packet(1)]);
    wait_until("retry", || server.inner.usage(id) == Some(UsageInfo::new(10, 0))).await;
}

#[derive(Debug, Clone)]
enum Traffic {
    FromClient(usize),
    ToClient(usize),
}

fn traffic() -> impl Strategy<Value = Traffic> {
    prop_oneof![
        (1usize..1500).prop_map(Traffic::FromClient),
        (1usize..1500).prop_map(Traffic::ToClient),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_reported_usage_is_conserved(
        sync_cache_size in 0u64..4000,
        steps in prop::collection::vec(traffic(), 1..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let server = Arc::new(MemoryAccessServer::new());
            let response = server.create_session(identity(), None, None);
            let id = response.session_id;
            let session = Session::new(&env(server.clone(), sync_cache_size), response, host(), None).unwrap();
            session
                .add_stream_datagram_channel(Arc::new(StreamDatagramChannel::new(tokio::io::sink())))
                .unwrap();

            for step in &steps {
                match step {
                    Traffic::FromClient(len) => session.tunnel().on_packets_received(vec![packet(*len)]),
                    Traffic::ToClient(len) => session.tunnel().send_packet(packet(*len)).await.unwrap(),
                }
                tokio::task::yield_now().await;
            }

            let received = session.tunnel().received_byte_count();
            let sent = session.tunnel().sent_byte_count();
            session.dispose();
            wait_until("remote close", || server.is_session_closed(id)).await;

            prop_assert_eq!(server.usage(id), Some(UsageInfo::new(received, sent)));
            Ok(())
        })?;
    }
}
