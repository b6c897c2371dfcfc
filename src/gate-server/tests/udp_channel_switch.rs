//! Switching a session between its UDP channel and stream datagram channels.

use async_trait::async_trait;
use bytes::Bytes;
use gate_common::ClientIdentity;
use gate_server::{
    AddressFamily, ChannelKind, DatagramChannel, DefaultSocketFactory, MemoryAccessServer,
    Session, SessionEnv, SessionOptions, SocketFactory, StreamDatagramChannel,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Socket factory that parks every bind until released.
#[derive(Default)]
struct GatedSocketFactory {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl SocketFactory for GatedSocketFactory {
    async fn create_udp_socket(&self, family: AddressFamily) -> io::Result<UdpSocket> {
        self.entered.notify_one();
        self.release.notified().await;
        DefaultSocketFactory.create_udp_socket(family).await
    }
}

async fn new_session() -> Arc<Session> {
    session_with_factory(Arc::new(DefaultSocketFactory))
}

fn session_with_factory(socket_factory: Arc<dyn SocketFactory>) -> Arc<Session> {
    let server = Arc::new(MemoryAccessServer::new());
    let (network_tx, _network_rx) = mpsc::channel(16);
    let env = SessionEnv {
        access_server: server.clone(),
        socket_factory,
        network_tx,
        options: SessionOptions::default(),
    };
    let identity = ClientIdentity::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
    );
    let response = server.create_session(identity, None, None);
    let host: SocketAddr = "127.0.0.1:443".parse().unwrap();
    Session::new(&env, response, host, None).unwrap()
}

fn stream_channel() -> Arc<StreamDatagramChannel> {
    Arc::new(StreamDatagramChannel::new(tokio::io::sink()))
}

#[tokio::test]
async fn test_setting_current_value_is_noop() {
    let session = new_session().await;
    assert!(!session.use_udp_channel());

    let stream = stream_channel();
    session.add_stream_datagram_channel(stream.clone()).unwrap();
    session.set_use_udp_channel(false).await.unwrap();
    assert_eq!(session.tunnel().datagram_channel_count(), 1);
    assert!(!stream.is_closed());

    session.set_use_udp_channel(true).await.unwrap();
    let first = session.udp_channel_response().unwrap();
    let channel_id = session.tunnel().datagram_channels()[0].id();

    session.set_use_udp_channel(true).await.unwrap();
    let again = session.udp_channel_response().unwrap();
    assert_eq!(again.udp_key, first.udp_key);
    assert_eq!(again.udp_port, first.udp_port);
    assert_eq!(session.tunnel().datagram_channels()[0].id(), channel_id);
}

#[tokio::test]
async fn test_enabling_replaces_stream_datagram_channels() {
    let session = new_session().await;
    let a = stream_channel();
    let b = stream_channel();
    session.add_stream_datagram_channel(a.clone()).unwrap();
    session.add_stream_datagram_channel(b.clone()).unwrap();
    session.tunnel().add_stream_channel();
    assert_eq!(session.tcp_connection_count(), 3);

    session.set_use_udp_channel(true).await.unwrap();

    let channels = session.tunnel().datagram_channels();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].kind(), ChannelKind::Udp);
    assert!(a.is_closed() && b.is_closed());
    assert!(session.use_udp_channel());
    assert_eq!(session.tunnel().stream_channel_count(), 1);
    assert_eq!(session.tcp_connection_count(), 1);
    assert_eq!(session.udp_connection_count(), 1);
}

#[tokio::test]
async fn test_disabling_removes_only_udp_channel() {
    let session = new_session().await;
    session.tunnel().add_stream_channel();
    session.set_use_udp_channel(true).await.unwrap();
    session.set_use_udp_channel(false).await.unwrap();

    assert!(!session.use_udp_channel());
    assert_eq!(session.tunnel().datagram_channel_count(), 0);
    assert_eq!(session.tunnel().stream_channel_count(), 1);
    assert!(session.udp_channel_response().is_none());
}

#[tokio::test]
async fn test_reactivation_rekeys() {
    let session = new_session().await;
    session.set_use_udp_channel(true).await.unwrap();
    let first = session.udp_channel_response().unwrap();
    session.set_use_udp_channel(false).await.unwrap();
    session.set_use_udp_channel(true).await.unwrap();
    let second = session.udp_channel_response().unwrap();

    assert_eq!(first.udp_key.len(), 16);
    assert_ne!(first.udp_key, second.udp_key);
}

#[tokio::test]
async fn test_udp_channel_carries_packets_both_ways() {
    let session = new_session().await;
    session.set_use_udp_channel(true).await.unwrap();
    let port = session.udp_channel_response().unwrap().udp_port;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"hello", SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .unwrap();

    for _ in 0..400 {
        if session.tunnel().received_byte_count() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(session.tunnel().received_byte_count(), 5);

    session
        .tunnel()
        .send_packet(Bytes::from_static(b"reply"))
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"reply");
}

#[tokio::test]
async fn test_stream_channel_attached_during_switch_is_replaced() {
    let factory = Arc::new(GatedSocketFactory::default());
    let session = session_with_factory(factory.clone());

    let switching = {
        let session = session.clone();
        tokio::spawn(async move { session.set_use_udp_channel(true).await })
    };
    factory.entered.notified().await;

    let stream = stream_channel();
    session.add_stream_datagram_channel(stream.clone()).unwrap();
    factory.release.notify_one();
    switching.await.unwrap().unwrap();

    let kinds: Vec<_> = session
        .tunnel()
        .datagram_channels()
        .iter()
        .map(|c| c.kind())
        .collect();
    assert_eq!(kinds, vec![ChannelKind::Udp]);
    assert!(stream.is_closed());
    assert!(session.use_udp_channel());

    session.set_use_udp_channel(false).await.unwrap();
    assert_eq!(session.tunnel().datagram_channel_count(), 0);
    assert!(session.udp_channel().is_none());
}
