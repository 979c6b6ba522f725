//! Integration tests for the TCP transport over real loopback sockets

use std::time::Duration;

use peerwire_core::events::{connection_event_channel, server_event_channel};
use peerwire_core::{
    BincodeCodec, ConnectionEvent, ConnectionEventReceiver, ConnectionState, DuplicateNamePolicy,
    Envelope, PeerwireError, ProtocolError, ServerEvent, ServerEventReceiver, TransportConfig,
    DEFAULT_MAX_FRAME_LEN, IDENTIFY_TYPE_CODE,
};
use peerwire_tcp::{TcpConfig, TcpConnection, TcpServer};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Chat {
    body: String,
}

async fn next_server_event<F>(rx: &mut ServerEventReceiver, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("server event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

async fn next_conn_event<F>(rx: &mut ConnectionEventReceiver, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("connection event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for connection event")
}

async fn start_server(config: TcpConfig) -> (TcpServer, ServerEventReceiver) {
    let (tx, rx) = server_event_channel();
    let server = TcpServer::new(config, tx);
    assert_ok!(server.start().await);
    (server, rx)
}

async fn connect_named(
    server: &TcpServer,
    server_rx: &mut ServerEventReceiver,
    name: &str,
) -> (TcpConnection, ConnectionEventReceiver) {
    let addr = server.local_addr().expect("server not started");
    let (tx, rx) = connection_event_channel();
    let conn = TcpConnection::connect(addr, name, &BincodeCodec, &TcpConfig::loopback(), tx)
        .await
        .expect("connect failed");
    assert_ok!(conn.start().await);
    let expected = name.to_string();
    next_server_event(server_rx, |e| {
        matches!(e, ServerEvent::Identified { identity, .. } if identity.logical_name == expected)
    })
    .await;
    (conn, rx)
}

#[tokio::test]
async fn test_identification_registers_name() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    assert!(!server.has_connection("peerA").await);

    let (client, _rx) = connect_named(&server, &mut events, "peerA").await;
    assert!(server.has_connection("peerA").await);
    assert_eq!(server.get_connections(&["peerA"]).await.len(), 1);
    assert!(server.get_connections(&["ghost"]).await.is_empty());
    assert_eq!(client.state(), ConnectionState::Ready);

    server.stop().await;
}

#[tokio::test]
async fn test_send_reaches_only_named_peer() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (_a, mut a_rx) = connect_named(&server, &mut events, "peerA").await;
    let (b, _b_rx) = connect_named(&server, &mut events, "peerB").await;

    let chat = Chat {
        body: "hello A".into(),
    };
    let report = server.send_value(1, &chat, &["peerA"]).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.all_ok());

    let received = next_conn_event(&mut a_rx, |e| matches!(e, ConnectionEvent::Received { .. })).await;
    match received {
        ConnectionEvent::Received { envelope, .. } => {
            let decoded: Chat = envelope.to_object_tagged(&BincodeCodec, 1).unwrap();
            assert_eq!(decoded, chat);
        }
        other => panic!("unexpected event {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.stats().messages_received, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_client_messages_are_attributed() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (client, _rx) = connect_named(&server, &mut events, "peerA").await;

    let sent = assert_ok!(
        client
            .send_value(&BincodeCodec, 2, &Chat { body: "hi".into() })
            .await
    );
    assert!(sent > 0);

    let event = next_server_event(&mut events, |e| matches!(e, ServerEvent::Received { .. })).await;
    match event {
        ServerEvent::Received { from, envelope, .. } => {
            assert_eq!(from.logical_name, "peerA");
            assert_eq!(envelope.type_code, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_broadcast_and_unknown_names() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (_a, mut a_rx) = connect_named(&server, &mut events, "peerA").await;
    let (_b, mut b_rx) = connect_named(&server, &mut events, "peerB").await;

    let envelope = Envelope::new(3, b"all".to_vec()).unwrap();
    let report = server.send::<&str>(&envelope, &[]).await;
    assert_eq!(report.delivered(), 2);

    for rx in [&mut a_rx, &mut b_rx] {
        next_conn_event(rx, |e| matches!(e, ConnectionEvent::Received { .. })).await;
    }

    let report = server.send(&envelope, &["peerA", "ghost"]).await;
    assert_eq!(report.delivered(), 1);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target, "ghost");
    assert!(matches!(
        failed[0].result,
        Err(PeerwireError::PeerNotFound { .. })
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_stops_connection() {
    let config = TcpConfig::loopback().with_max_frame_len(64);
    let (server, mut events) = start_server(config).await;
    let addr = server.local_addr().unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    next_server_event(&mut events, |e| matches!(e, ServerEvent::Accepted { .. })).await;
    raw.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();

    let event =
        next_server_event(&mut events, |e| matches!(e, ServerEvent::Disconnected { .. })).await;
    match event {
        ServerEvent::Disconnected { error, .. } => {
            let error = error.expect("disconnect should carry a cause");
            assert!(matches!(
                *error,
                PeerwireError::Protocol(ProtocolError::FrameTooLarge { .. })
            ));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(server.peers().await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_remote_close_reports_stop_once() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (client, mut rx) = connect_named(&server, &mut events, "peerA").await;

    server.stop().await;
    next_conn_event(&mut rx, |e| matches!(e, ConnectionEvent::Stopped { .. })).await;
    client.stop();
    client.stop();

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, ConnectionEvent::Stopped { .. }));
    }
    assert!(client.state().is_terminal());
    assert_err!(client.send(&Envelope::new(1, vec![]).unwrap()).await);
}

#[tokio::test]
async fn test_server_stop_is_idempotent() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (_a, _rx) = connect_named(&server, &mut events, "peerA").await;

    server.stop().await;
    server.stop().await;

    let mut stopped = 0;
    let mut disconnected = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ServerEvent::Stopped { .. } => stopped += 1,
            ServerEvent::Disconnected { .. } => disconnected += 1,
            _ => {}
        }
    }
    assert_eq!(stopped, 1);
    assert_eq!(disconnected, 1);
    assert!(!server.has_connection("peerA").await);
    assert_err!(server.start().await);
}

#[tokio::test]
async fn test_duplicate_name_rejected_by_default() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (first, _first_rx) = connect_named(&server, &mut events, "peerA").await;

    let (tx, mut second_rx) = connection_event_channel();
    let second = TcpConnection::connect(
        server.local_addr().unwrap(),
        "peerA",
        &BincodeCodec,
        &TcpConfig::loopback(),
        tx,
    )
    .await
    .unwrap();
    second.start().await.unwrap();

    let event =
        next_server_event(&mut events, |e| matches!(e, ServerEvent::Disconnected { .. })).await;
    match event {
        ServerEvent::Disconnected { error, .. } => assert!(matches!(
            error.as_deref(),
            Some(PeerwireError::Protocol(ProtocolError::DuplicateName { .. }))
        )),
        other => panic!("unexpected event {:?}", other),
    }
    next_conn_event(&mut second_rx, |e| matches!(e, ConnectionEvent::Stopped { .. })).await;

    assert_eq!(first.state(), ConnectionState::Ready);
    let holders = server.get_connections(&["peerA"]).await;
    assert_eq!(holders.len(), 1);
    assert_eq!(server.peers().await.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_name_replaces_when_configured() {
    let transport =
        TransportConfig::new().with_duplicate_name_policy(DuplicateNamePolicy::ReplaceExisting);
    let (server, mut events) = start_server(TcpConfig::loopback().with_transport(transport)).await;
    let (_first, mut first_rx) = connect_named(&server, &mut events, "peerA").await;
    let (_second, _second_rx) = connect_named(&server, &mut events, "peerA").await;

    next_conn_event(&mut first_rx, |e| matches!(e, ConnectionEvent::Stopped { .. })).await;
    assert_eq!(server.peers().await.len(), 1);
    assert!(server.has_connection("peerA").await);

    server.stop().await;
}

#[tokio::test]
async fn test_wait_ready_and_stats() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let (client, _rx) = connect_named(&server, &mut events, "peerA").await;
    assert_ok!(client.wait_ready().await);

    // identification counts as the first send
    assert_eq!(client.stats().messages_sent, 1);
    client
        .send(&Envelope::new(4, vec![0; 10]).unwrap())
        .await
        .unwrap();
    let stats = client.stats();
    assert_eq!(stats.messages_sent, 2);
    assert_eq!(stats.bytes_sent as usize, 11 + client_identification_len());

    server.stop().await;
}

fn client_identification_len() -> usize {
    Envelope::identification(&BincodeCodec, "peerA")
        .unwrap()
        .encoded_len()
}

/// Frame limit large enough that one send outruns both socket buffers
const STALLED_SEND_LEN: usize = 32 * 1024 * 1024;

/// A started client whose far end accepts the socket and never reads it
async fn client_to_silent_peer() -> (TcpConnection, ConnectionEventReceiver, TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = TcpConfig::loopback().with_max_frame_len(STALLED_SEND_LEN + 1);
    let (tx, rx) = connection_event_channel();
    let (client, accepted) = tokio::join!(
        TcpConnection::connect(addr, "writer", &BincodeCodec, &config, tx),
        listener.accept()
    );
    let client = client.unwrap();
    let (peer, _) = accepted.unwrap();
    assert_ok!(client.start().await);
    (client, rx, peer)
}

fn stalled_send(client: &TcpConnection) -> tokio::task::JoinHandle<peerwire_core::Result<usize>> {
    let sender = client.clone();
    let envelope = Envelope::new(5, vec![7; STALLED_SEND_LEN]).unwrap();
    tokio::spawn(async move { sender.send(&envelope).await })
}

#[tokio::test]
async fn test_stop_unblocks_stalled_send() {
    let (client, mut rx, _peer) = client_to_silent_peer().await;

    let pending = stalled_send(&client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());
    assert_eq!(client.state(), ConnectionState::Ready);

    client.stop();
    client.stop();

    let result = timeout(WAIT, pending)
        .await
        .expect("send stayed blocked after stop")
        .unwrap();
    let err = assert_err!(result);
    assert!(err.is_transport());

    next_conn_event(&mut rx, |e| matches!(e, ConnectionEvent::Stopped { .. })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, ConnectionEvent::Stopped { .. }));
    }
    assert_eq!(client.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_stalled_send_does_not_block_receive() {
    let (client, mut rx, mut peer) = client_to_silent_peer().await;

    let pending = stalled_send(&client);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    let inbound = Envelope::new(3, b"still here".to_vec()).unwrap();
    let frame =
        peerwire_core::framing::encode_frame(&inbound.to_bytes(), DEFAULT_MAX_FRAME_LEN).unwrap();
    peer.write_all(&frame).await.unwrap();

    match next_conn_event(&mut rx, |e| matches!(e, ConnectionEvent::Received { .. })).await {
        ConnectionEvent::Received { envelope, .. } => assert_eq!(envelope, inbound),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!pending.is_finished());
    assert_eq!(client.stats().messages_received, 1);

    client.stop();
    assert_err!(timeout(WAIT, pending).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_undecodable_identification_is_dropped() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let mut raw = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    let frame = |bytes: &[u8]| {
        peerwire_core::framing::encode_frame(bytes, DEFAULT_MAX_FRAME_LEN).unwrap()
    };

    let identify = Envelope::identification(&BincodeCodec, "raw").unwrap();
    raw.write_all(&frame(&identify.to_bytes())).await.unwrap();
    next_server_event(&mut events, |e| matches!(e, ServerEvent::Identified { .. })).await;

    // identification tag followed by bytes that are not an encoded name
    raw.write_all(&frame(&[IDENTIFY_TYPE_CODE, 0xFF, 0xFF, 0xFF]))
        .await
        .unwrap();
    let message = Envelope::new(2, vec![1, 2, 3]).unwrap();
    raw.write_all(&frame(&message.to_bytes())).await.unwrap();

    let event = next_server_event(&mut events, |e| {
        matches!(
            e,
            ServerEvent::Received { .. } | ServerEvent::Disconnected { .. }
        )
    })
    .await;
    match event {
        ServerEvent::Received { from, envelope, .. } => {
            assert_eq!(from.logical_name, "raw");
            assert_eq!(envelope, message);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let holders = server.get_connections(&["raw"]).await;
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].state(), ConnectionState::Ready);

    server.stop().await;
}

#[tokio::test]
async fn test_dropped_server_releases_listener_and_peers() {
    let (server, mut events) = start_server(TcpConfig::loopback()).await;
    let addr = server.local_addr().unwrap();
    let (client, mut rx) = connect_named(&server, &mut events, "peerA").await;

    drop(server);

    next_conn_event(&mut rx, |e| matches!(e, ConnectionEvent::Stopped { .. })).await;
    assert!(client.state().is_terminal());
    next_server_event(&mut events, |e| matches!(e, ServerEvent::Stopped { .. })).await;

    timeout(WAIT, async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener still accepting after drop");
}
